// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordinator Context - Application Layer
//!
//! Shared, read-only handles every task needs (configuration, repositories,
//! spool, broker, signing key) plus the senders of the channels that connect
//! the tasks. Receivers are handed out once, in [`ChannelReceivers`], to the
//! single task that owns each pipeline stage.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Dependency wiring and inter-task channels

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::application::error::CoordinatorError;
use crate::application::repository_factory::Repositories;
use crate::domain::acl::Acl;
use crate::domain::action::ActionId;
use crate::domain::command::Command;
use crate::domain::events::CoordinatorEvent;
use crate::domain::id::IdGenerator;
use crate::domain::scheduler_config::SchedulerConfigSpec;
use crate::domain::signature::Signer;
use crate::infrastructure::broker::{publish_with_retry, Broker, Exchange, Message};
use crate::infrastructure::spool::Spool;

const CHANNEL_CAPACITY: usize = 4096;

/// Agent queue locations allowed to register. Lines are exact queue
/// locations or `re:<regex>`; regexes are anchored.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    exact: Vec<String>,
    patterns: Vec<regex::Regex>,
}

impl Whitelist {
    pub fn parse(content: &str) -> Result<Self, regex::Error> {
        let mut whitelist = Self::default();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            match line.strip_prefix("re:") {
                Some(re) => whitelist.patterns.push(regex::Regex::new(&format!("^(?:{})$", re))?),
                None => whitelist.exact.push(line.to_string()),
            }
        }
        Ok(whitelist)
    }

    pub fn is_authorized(&self, queue_loc: &str) -> bool {
        self.exact.iter().any(|q| q == queue_loc) || self.patterns.iter().any(|re| re.is_match(queue_loc))
    }
}

/// Senders connecting the pipeline stages.
#[derive(Clone)]
pub struct Channels {
    pub new_action: mpsc::Sender<PathBuf>,
    pub command_ready: mpsc::Sender<Command>,
    pub command_returned: mpsc::Sender<PathBuf>,
    pub command_done: mpsc::Sender<ActionId>,
    pub detect_dup: mpsc::Sender<String>,
    pub terminate: mpsc::UnboundedSender<String>,
}

pub struct ChannelReceivers {
    pub new_action: mpsc::Receiver<PathBuf>,
    pub command_ready: mpsc::Receiver<Command>,
    pub command_returned: mpsc::Receiver<PathBuf>,
    pub command_done: mpsc::Receiver<ActionId>,
    pub detect_dup: mpsc::Receiver<String>,
    pub terminate: mpsc::UnboundedReceiver<String>,
}

impl Channels {
    pub fn new() -> (Self, ChannelReceivers) {
        let (new_action, new_action_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_ready, command_ready_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_returned, command_returned_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_done, command_done_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (detect_dup, detect_dup_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (terminate, terminate_rx) = mpsc::unbounded_channel();
        (
            Self {
                new_action,
                command_ready,
                command_returned,
                command_done,
                detect_dup,
                terminate,
            },
            ChannelReceivers {
                new_action: new_action_rx,
                command_ready: command_ready_rx,
                command_returned: command_returned_rx,
                command_done: command_done_rx,
                detect_dup: detect_dup_rx,
                terminate: terminate_rx,
            },
        )
    }
}

/// The scheduler's own signing identity, used for kill actions.
pub struct SchedulerKey {
    pub signer: Arc<dyn Signer>,
    pub key_id: String,
}

pub struct CoordinatorContext {
    pub name: String,
    pub config: SchedulerConfigSpec,
    pub repos: Repositories,
    pub spool: Arc<Spool>,
    pub broker: Arc<dyn Broker>,
    pub ids: Arc<dyn IdGenerator>,
    pub key: Option<SchedulerKey>,
    pub acl: Acl,
    pub whitelist: Option<Whitelist>,
    pub channels: Channels,
}

impl CoordinatorContext {
    /// Publishes an event on the workers exchange. Failures are returned
    /// after the configured number of attempts.
    pub async fn publish_event(&self, event: &CoordinatorEvent) -> Result<(), CoordinatorError> {
        let body = serde_json::to_vec(event)?;
        publish_with_retry(
            self.broker.as_ref(),
            Exchange::ToWorkers,
            event.routing_key(),
            Message::json(body),
            self.config.broker.publish_retries,
        )
        .await?;
        Ok(())
    }

    /// Fire-and-forget variant for informational events.
    pub async fn notify(&self, event: CoordinatorEvent) {
        if let Err(e) = self.publish_event(&event).await {
            warn!(event = event.routing_key(), error = %e, "failed to publish event");
        }
    }

    /// Asks the runtime to shut the process down.
    pub fn request_termination(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "requesting coordinator termination");
        let _ = self.channels.terminate.send(reason);
    }
}
