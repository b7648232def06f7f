// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Broker Listeners - Application Layer
//!
//! Consumers of the coordinator queues and the coordinator's own heartbeat:
//!
//! - [`HeartbeatListener`] keeps the agent registry current from
//!   `mig.agt.heartbeats`;
//! - [`ResultsListener`] spools returned commands from `mig.agt.results`;
//! - [`SelfHeartbeat`] announces this coordinator on the events exchange.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Agent heartbeat ingestion, result intake, liveness

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::CoordinatorContext;
use crate::application::error::CoordinatorError;
use crate::domain::agent::{Agent, AgentError, AgentId, AgentStatus};
use crate::domain::command::{Command, CommandError};
use crate::domain::events::CoordinatorEvent;
use crate::infrastructure::broker::{Delivery, HEARTBEAT_QUEUE, RESULTS_QUEUE};
use crate::infrastructure::spool::SpoolDir;

pub const MAX_HEARTBEAT_SIZE: usize = 100 * 1024;
pub const MIN_RESULT_SIZE: usize = 10;
pub const SELF_HEARTBEAT_FREQ: Duration = Duration::from_secs(60);
/// A heartbeat whose refresh time moved by more than this replaces the
/// stored agent record.
const REFRESH_THRESHOLD: chrono::Duration = chrono::Duration::seconds(15);

/// How a heartbeat was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered(AgentId),
    Updated(AgentId),
    Refreshed(AgentId),
    /// The agent is destroyed; its heartbeat only triggers duplicate checks.
    Destroyed(AgentId),
    Stale,
    Unauthorized,
}

pub struct HeartbeatListener {
    ctx: Arc<CoordinatorContext>,
}

impl HeartbeatListener {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<tokio::task::JoinHandle<()>, CoordinatorError> {
        let mut rx = self.ctx.broker.consume(HEARTBEAT_QUEUE).await?;
        Ok(tokio::spawn(async move {
            info!(queue = HEARTBEAT_QUEUE, "heartbeat listener started");
            loop {
                tokio::select! {
                    delivery = rx.recv() => match delivery {
                        Some(delivery) => {
                            if let Err(e) = self.handle(&delivery.body).await {
                                warn!(error = %e, "heartbeat rejected");
                            }
                        }
                        None => {
                            warn!("heartbeat consumer closed");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }

    pub async fn handle(&self, body: &[u8]) -> Result<HeartbeatOutcome, CoordinatorError> {
        if body.len() > MAX_HEARTBEAT_SIZE {
            return Err(AgentError::InvalidHeartbeat(format!(
                "heartbeat of {} bytes exceeds {} bytes",
                body.len(),
                MAX_HEARTBEAT_SIZE
            ))
            .into());
        }
        let now = Utc::now();
        let mut agent: Agent = serde_json::from_slice(body)?;
        metrics::counter!("mig_heartbeats_total").increment(1);

        let timeout = chrono::Duration::from_std(self.ctx.config.agent.timeout).unwrap_or(chrono::Duration::zero());
        if agent.heartbeat_ts < now - timeout {
            debug!(agent = %agent.name, heartbeat = %agent.heartbeat_ts, "dropping stale heartbeat");
            return Ok(HeartbeatOutcome::Stale);
        }
        agent.heartbeat_ts = now;
        agent.check_heartbeat()?;

        if self.ctx.config.debug.heartbeats {
            info!(agent = %agent.name, queueloc = %agent.queue_loc, pid = agent.pid, "heartbeat received");
        }

        if let Some(whitelist) = &self.ctx.whitelist {
            if !whitelist.is_authorized(&agent.queue_loc) {
                warn!(agent = %agent.name, queueloc = %agent.queue_loc, "agent is not whitelisted");
                self.ctx
                    .notify(CoordinatorEvent::AgentAuthFailed {
                        queue_loc: agent.queue_loc.clone(),
                        pid: agent.pid,
                        at: now,
                    })
                    .await;
                return Ok(HeartbeatOutcome::Unauthorized);
            }
        }
        agent.authorized = true;

        let agents = &self.ctx.repos.agents;
        let Some(known) = agents.agent_by_queue_and_pid(&agent.queue_loc, agent.pid).await? else {
            agent.id = AgentId(self.ctx.ids.next_id());
            agent.status = AgentStatus::Online;
            agent.start_time = now;
            agent.destruction_time = None;
            agents.insert_agent(&agent).await?;
            info!(agent_id = %agent.id, agent = %agent.name, queueloc = %agent.queue_loc, "new agent registered");
            let id = agent.id;
            self.ctx
                .notify(CoordinatorEvent::AgentNew { agent: Box::new(agent) })
                .await;
            return Ok(HeartbeatOutcome::Registered(id));
        };

        if known.is_destroyed() {
            agent.id = known.id;
            agent.status = AgentStatus::Destroyed;
            agent.destruction_time = known.destruction_time;
            agents.update_agent_heartbeat(&agent).await?;
            if self.ctx.config.agent.detect_multi_agents {
                if self.ctx.channels.detect_dup.send(agent.queue_loc.clone()).await.is_err() {
                    warn!(queueloc = %agent.queue_loc, "duplicate detection is not running, check skipped");
                }
            }
            return Ok(HeartbeatOutcome::Destroyed(known.id));
        }

        let refreshed = match (agent.refresh_ts, known.refresh_ts) {
            (Some(new), Some(old)) => new - old > REFRESH_THRESHOLD,
            (Some(_), None) => true,
            _ => false,
        };
        if refreshed {
            agent.id = AgentId(self.ctx.ids.next_id());
            agent.status = AgentStatus::Online;
            agent.start_time = known.start_time;
            agents.replace_refreshed_agent(known.id, &agent).await?;
            debug!(agent_id = %agent.id, previous = %known.id, "agent environment refreshed");
            return Ok(HeartbeatOutcome::Refreshed(agent.id));
        }

        agent.id = known.id;
        agents.update_agent_heartbeat(&agent).await?;
        Ok(HeartbeatOutcome::Updated(known.id))
    }
}

pub struct ResultsListener {
    ctx: Arc<CoordinatorContext>,
}

impl ResultsListener {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<tokio::task::JoinHandle<()>, CoordinatorError> {
        let mut rx = self.ctx.broker.consume(RESULTS_QUEUE).await?;
        Ok(tokio::spawn(async move {
            info!(queue = RESULTS_QUEUE, "results listener started");
            loop {
                tokio::select! {
                    delivery = rx.recv() => match delivery {
                        Some(delivery) => {
                            if let Err(e) = self.handle(&delivery).await {
                                warn!(error = %e, "discarding agent results");
                            }
                        }
                        None => {
                            warn!("results consumer closed");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }

    /// Writes the returned command to `command/returned/`. The document is
    /// named after the command it carries; one that cannot be parsed still
    /// lands there under a generated name so the aggregator quarantines it.
    pub async fn handle(&self, delivery: &Delivery) -> Result<std::path::PathBuf, CoordinatorError> {
        let body = delivery.body.as_ref();
        let trimmed = body.trim_ascii();
        if body.len() < MIN_RESULT_SIZE || !trimmed.starts_with(b"{") || !trimmed.ends_with(b"}") {
            return Err(CommandError::Syntax("results message is not a JSON object".to_string()).into());
        }

        let dest = match Command::from_json(body) {
            Ok(command) => {
                let path = self.ctx.spool.command_path(SpoolDir::CommandReturned, &command);
                self.ctx
                    .notify(CoordinatorEvent::CommandReturned {
                        action_id: command.action.id,
                        command_id: command.id,
                        at: Utc::now(),
                    })
                    .await;
                path
            }
            Err(e) => {
                debug!(error = %e, "returned command does not parse, spooling for quarantine");
                self.ctx
                    .spool
                    .dir(SpoolDir::CommandReturned)
                    .join(format!("{}.json", self.ctx.ids.next_id()))
            }
        };
        self.ctx.spool.safe_write(&dest, body).await?;
        Ok(dest)
    }
}

/// Announces the coordinator on the events exchange. Running out of publish
/// attempts requests process termination.
pub struct SelfHeartbeat {
    ctx: Arc<CoordinatorContext>,
    freq: Duration,
}

impl SelfHeartbeat {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self {
            ctx,
            freq: SELF_HEARTBEAT_FREQ,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string());
            let mut tick = tokio::time::interval(self.freq);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.beat(&host).await {
                            self.ctx.request_termination(format!("scheduler heartbeat failed: {}", e));
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub async fn beat(&self, host: &str) -> Result<(), CoordinatorError> {
        let event = CoordinatorEvent::SchedulerHeartbeat {
            host: host.to_string(),
            pid: std::process::id(),
            at: Utc::now(),
        };
        self.ctx.publish_event(&event).await?;
        debug!(host, "scheduler heartbeat published");
        Ok(())
    }
}
