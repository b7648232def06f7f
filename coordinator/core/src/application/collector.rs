// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Collector - Application Layer
//!
//! Periodic sweep feeding the pipelines:
//!
//! 1. pending actions whose window opened are claimed from the store and
//!    spooled into `action/new/`;
//! 2. every document in `action/new/` goes to the dispatcher;
//! 3. every document in `command/returned/` goes to the aggregator;
//! 4. in-flight commands whose action expired are returned as `expired`.
//!
//! Each step is its own unit of work: a failure is logged and the next step
//! still runs.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::CoordinatorContext;
use crate::application::error::CoordinatorError;
use crate::domain::command::Command;
use crate::infrastructure::spool::SpoolDir;

/// Counts of one collector pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectReport {
    pub scheduled: usize,
    pub new_actions: usize,
    pub returned: usize,
    pub expired: usize,
}

pub struct Collector {
    ctx: Arc<CoordinatorContext>,
}

impl Collector {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    async fn run(&self, cancel: CancellationToken) {
        let freq = self.ctx.config.collector.freq;
        info!(freq = ?freq, "starting collector");
        let mut tick = tokio::time::interval(freq);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.collect().await;
                    debug!(?report, "collector pass completed");
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("collector stopped");
    }

    /// Runs one full pass.
    pub async fn collect(&self) -> CollectReport {
        let mut report = CollectReport::default();
        match self.spool_runnable_actions().await {
            Ok(n) => report.scheduled = n,
            Err(e) => warn!(error = %e, "failed to load runnable actions from the store"),
        }
        match self.scan_new_actions().await {
            Ok(n) => report.new_actions = n,
            Err(e) => warn!(error = %e, "failed to scan new actions"),
        }
        match self.scan_returned_commands().await {
            Ok(n) => report.returned = n,
            Err(e) => warn!(error = %e, "failed to scan returned commands"),
        }
        match self.expire_commands().await {
            Ok(n) => report.expired = n,
            Err(e) => warn!(error = %e, "failed to expire in-flight commands"),
        }
        report
    }

    /// Claims ready `pending` actions in the store and writes them to
    /// `action/new/`.
    async fn spool_runnable_actions(&self) -> Result<usize, CoordinatorError> {
        let actions = self.ctx.repos.actions.schedule_ready_actions(Utc::now()).await?;
        for action in &actions {
            self.ctx.spool.write_action(SpoolDir::ActionNew, action).await?;
            info!(action_id = %action.id, name = %action.name, "scheduled action from store");
        }
        Ok(actions.len())
    }

    async fn scan_new_actions(&self) -> Result<usize, CoordinatorError> {
        let entries = self.ctx.spool.list(SpoolDir::ActionNew).await?;
        for entry in &entries {
            if self.ctx.channels.new_action.send(entry.path.clone()).await.is_err() {
                return Err(CoordinatorError::Fatal("new action channel closed".to_string()));
            }
        }
        Ok(entries.len())
    }

    async fn scan_returned_commands(&self) -> Result<usize, CoordinatorError> {
        let entries = self.ctx.spool.list(SpoolDir::CommandReturned).await?;
        for entry in &entries {
            if self.ctx.channels.command_returned.send(entry.path.clone()).await.is_err() {
                return Err(CoordinatorError::Fatal("command returned channel closed".to_string()));
            }
        }
        Ok(entries.len())
    }

    /// Moves in-flight commands of expired actions to `command/returned/`
    /// with status `expired`.
    async fn expire_commands(&self) -> Result<usize, CoordinatorError> {
        let now = Utc::now();
        let mut expired = 0;
        for entry in self.ctx.spool.list(SpoolDir::CommandInflight).await? {
            let data = match self.ctx.spool.read(&entry.path).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "cannot read in-flight command");
                    continue;
                }
            };
            let mut command = match Command::from_json(&data) {
                Ok(command) => command,
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "in-flight command is invalid, quarantining");
                    self.ctx.spool.quarantine(&entry.path).await?;
                    continue;
                }
            };
            if !command.action.is_expired_at(now) {
                continue;
            }

            command.expire(now);
            self.ctx.spool.write_command(SpoolDir::CommandReturned, &command).await?;
            self.ctx.spool.remove(&entry.path).await?;
            info!(action_id = %command.action.id, command_id = %command.id, agent = %command.agent.name, "command expired");
            expired += 1;
        }
        Ok(expired)
    }
}

