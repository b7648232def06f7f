// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Result Aggregator - Application Layer
//!
//! Finalizes returned commands and rolls their status up into the parent
//! action. Two batch stages feed it: returned command files, and the ids of
//! actions whose commands changed.
//!
//! Both store writes are conditional. A command already marked `success`
//! is never overwritten, and only the coordinator whose `finish_action`
//! matches the in-flight row lands the action.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Command finalization, counter roll-up, action landing

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::application::context::CoordinatorContext;
use crate::application::error::CoordinatorError;
use crate::domain::action::{Action, ActionId, ActionStatus};
use crate::domain::command::Command;
use crate::domain::events::CoordinatorEvent;
use crate::infrastructure::spool::SpoolDir;

/// What [`Aggregator::update_action`] did with an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionProgress {
    Running,
    Landed,
    /// Another coordinator landed it first, or it is not in flight.
    AlreadyFinal,
    Unknown,
}

pub struct Aggregator {
    ctx: Arc<CoordinatorContext>,
}

impl Aggregator {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    /// Finalizes a batch of returned command files and returns the ids of
    /// the actions they belong to. A file that cannot be parsed is
    /// quarantined; a file whose store write fails is left for the next pass.
    pub async fn return_commands(&self, paths: Vec<PathBuf>) -> Vec<ActionId> {
        let mut touched = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            match self.return_command(&path).await {
                Ok(Some(action_id)) => {
                    if seen.insert(action_id) {
                        touched.push(action_id);
                    }
                }
                Ok(None) => {}
                Err(e) => error!(path = %path.display(), error = %e, "failed to finalize returned command"),
            }
        }
        touched
    }

    async fn return_command(&self, path: &Path) -> Result<Option<ActionId>, CoordinatorError> {
        let data = match self.ctx.spool.read(path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut command = match Command::from_json(&data) {
            Ok(command) => command,
            Err(e) => {
                let failed = self.ctx.spool.quarantine(path).await?;
                warn!(path = %path.display(), renamed = %failed.display(), error = %e, "returned command is invalid, quarantined");
                return Ok(None);
            }
        };
        if !command.status.is_terminal() {
            let failed = self.ctx.spool.quarantine(path).await?;
            warn!(
                action_id = %command.action.id,
                command_id = %command.id,
                status = %command.status,
                renamed = %failed.display(),
                "returned command has no final status, quarantined"
            );
            metrics::counter!("mig_commands_rejected_total").increment(1);
            return Ok(None);
        }
        command.align_results();
        command.finish_time = Some(Utc::now());

        if self.ctx.repos.commands.finish_command(&command).await? {
            debug!(action_id = %command.action.id, command_id = %command.id, status = %command.status, "command finalized");
        } else {
            let race = CoordinatorError::ResourceRace(format!("command {}", command.id));
            debug!(action_id = %command.action.id, command_id = %command.id, "{}", race);
        }

        let inflight = self.ctx.spool.command_path(SpoolDir::CommandInflight, &command);
        self.ctx.spool.remove(&inflight).await?;
        self.ctx.spool.remove(path).await?;
        metrics::counter!("mig_commands_returned_total").increment(1);
        Ok(Some(command.action.id))
    }

    /// Recomputes the counters of each action and lands the complete ones.
    pub async fn update_actions(&self, ids: Vec<ActionId>) {
        for id in ids {
            if let Err(e) = self.update_action(id).await {
                error!(action_id = %id, error = %e, "failed to update action");
            }
        }
    }

    pub async fn update_action(&self, id: ActionId) -> Result<ActionProgress, CoordinatorError> {
        let Some(mut action) = self.ctx.repos.actions.action_by_id(id).await? else {
            warn!(action_id = %id, "returned command references an unknown action");
            return Ok(ActionProgress::Unknown);
        };
        if action.status != ActionStatus::Inflight {
            return Ok(ActionProgress::AlreadyFinal);
        }

        action.counters = self.ctx.repos.commands.action_counters(id).await?;
        action.last_update_time = Some(Utc::now());

        if action.counters.is_complete() {
            return self.land_action(action).await;
        }

        if !self.ctx.repos.actions.update_running_action(&action).await? {
            debug!(action_id = %id, "action left flight before its counters were stored");
            return Ok(ActionProgress::AlreadyFinal);
        }
        info!(
            action_id = %id,
            name = %action.name,
            progress = %action.counters.summary(),
            "action updated"
        );
        Ok(ActionProgress::Running)
    }

    /// Marks the action done. The conditional store update decides which
    /// coordinator lands it; only that one writes `action/done/`.
    async fn land_action(&self, mut action: Action) -> Result<ActionProgress, CoordinatorError> {
        let now = Utc::now();
        action.transition(ActionStatus::Done)?;
        action.finish_time = Some(now);

        let inflight = self.ctx.spool.action_path(SpoolDir::ActionInflight, &action);
        if !self.ctx.repos.actions.finish_action(&action).await? {
            debug!(action_id = %action.id, "action already landed by another coordinator");
            self.ctx.spool.remove(&inflight).await?;
            return Ok(ActionProgress::AlreadyFinal);
        }

        self.ctx.spool.write_action(SpoolDir::ActionDone, &action).await?;
        self.ctx.spool.remove(&inflight).await?;

        let duration_secs = action.start_time.map(|start| (now - start).num_seconds()).unwrap_or(0);
        info!(
            action_id = %action.id,
            name = %action.name,
            progress = %action.counters.summary(),
            duration_secs,
            "action landed"
        );
        metrics::counter!("mig_actions_landed_total").increment(1);
        self.ctx
            .notify(CoordinatorEvent::ActionLanded {
                action_id: action.id,
                counters: action.counters,
                at: now,
            })
            .await;
        Ok(ActionProgress::Landed)
    }
}
