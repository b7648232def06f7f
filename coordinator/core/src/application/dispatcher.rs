// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dispatcher - Application Layer
//!
//! Turns an action document from `action/new/` into one command per target
//! agent, and delivers ready commands to the agents.
//!
//! ```text
//! action/new ──▶ authorize ──▶ resolve targets ──▶ persist action + commands
//!                   │                 │                        │
//!                   ▼                 ▼                        ▼
//!            action/invalid    action/invalid           action/inflight ──▶ command_ready
//! ```
//!
//! Commands are stored as `sent` before the batcher writes them to
//! `command/inflight/` and publishes them, so a command is always durable
//! before any delivery attempt.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** New action ingestion and command delivery

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::CoordinatorContext;
use crate::application::error::CoordinatorError;
use crate::domain::acl::verify_acl;
use crate::domain::action::{Action, ActionCounters, ActionStatus};
use crate::domain::command::{Command, CommandId};
use crate::domain::events::CoordinatorEvent;
use crate::domain::repository::ActionUpsert;
use crate::infrastructure::broker::{agent_queue, publish_with_retry, Exchange, Message};
use crate::infrastructure::keyring::Ed25519PublicKeyring;
use crate::infrastructure::spool::SpoolDir;

/// What became of one new action document.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The validity window has not opened; the file stays in `action/new/`.
    Deferred,
    /// The file was already picked up by an earlier pass.
    Gone,
    Invalid { reason: String },
    Dispatched { action: Box<Action>, commands: Vec<Command> },
}

pub struct Dispatcher {
    ctx: Arc<CoordinatorContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn process_new_action(&self, path: &Path) -> Result<DispatchOutcome, CoordinatorError> {
        let now = Utc::now();
        let data = match self.ctx.spool.read(path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(DispatchOutcome::Gone),
            Err(e) => return Err(e.into()),
        };

        let mut action = match Action::from_json(&data) {
            Ok(action) => action,
            Err(e) => {
                let dest = self.ctx.spool.move_raw_to_invalid(path, now).await?;
                warn!(path = %path.display(), dest = %dest.display(), error = %e, "unparseable action moved to invalid");
                metrics::counter!("mig_actions_invalid_total").increment(1);
                return Ok(DispatchOutcome::Invalid { reason: e.to_string() });
            }
        };
        if action.id.0 == 0 {
            action.id.0 = self.ctx.ids.next_id();
        }

        if !action.is_ready_at(now) {
            debug!(action_id = %action.id, valid_from = %action.valid_from, "action is not ready for scheduling");
            return Ok(DispatchOutcome::Deferred);
        }
        if let Some(stored) = self.ctx.repos.actions.action_by_id(action.id).await? {
            if stored.status.is_dispatched() {
                return self.discard_replay(&action, stored.status, path).await;
            }
        }

        info!(
            action_id = %action.id,
            name = %action.name,
            target = %action.target,
            valid_from = %action.valid_from,
            expire_after = %action.expire_after,
            "new action received"
        );

        if action.is_expired_at(now) {
            return self.invalidate(action, path, "action expired before dispatch").await;
        }
        if let Err(e) = action.validate_at(now) {
            return self.invalidate(action, path, &e.to_string()).await;
        }
        let fingerprints = match self.authorize(&action).await {
            Ok(fingerprints) => fingerprints,
            Err(e) if e.is_permanent() => return self.invalidate(action, path, &e.to_string()).await,
            Err(e) => return Err(e),
        };

        let agents = self.ctx.repos.agents.active_agents_by_target(&action.target).await?;
        if agents.is_empty() {
            let reason = format!("no agents found for target '{}'", action.target);
            return self.invalidate(action, path, &reason).await;
        }
        info!(action_id = %action.id, agents = agents.len(), "found target agents");

        action.transition(ActionStatus::Preparing)?;
        action.start_time = Some(now);
        action.last_update_time = Some(now);
        action.counters = ActionCounters {
            sent: agents.len() as i64,
            inflight: agents.len() as i64,
            ..ActionCounters::default()
        };

        match self.ctx.repos.actions.insert_or_update_action(&action).await? {
            ActionUpsert::Inserted => self.store_signatures(&action, &fingerprints).await?,
            ActionUpsert::Updated => {}
            // another coordinator flew it between the lookup and the write
            ActionUpsert::Unchanged => return self.discard_replay(&action, ActionStatus::Inflight, path).await,
        }

        let commands: Vec<Command> = agents
            .into_iter()
            .map(|agent| Command::new(CommandId(self.ctx.ids.next_id()), action.clone(), agent, now))
            .collect();
        let inserted = self.ctx.repos.commands.insert_commands(&commands).await?;
        if inserted == 0 {
            return self.invalidate(action, path, "no command created").await;
        }
        debug!(action_id = %action.id, inserted, "commands stored");

        action.transition(ActionStatus::Inflight)?;
        self.fly_action(&action, path).await?;

        metrics::counter!("mig_actions_dispatched_total").increment(1);
        info!(action_id = %action.id, commands = commands.len(), "action dispatched");
        Ok(DispatchOutcome::Dispatched {
            action: Box::new(action),
            commands,
        })
    }

    /// Drops a new-action file whose action the store already holds in flight
    /// or final. Dispatching it again would rewind the action and send its
    /// commands twice.
    async fn discard_replay(
        &self,
        action: &Action,
        stored: ActionStatus,
        path: &Path,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        warn!(action_id = %action.id, status = %stored, "action already dispatched, discarding new file");
        self.ctx.spool.remove(path).await?;
        metrics::counter!("mig_actions_replayed_total").increment(1);
        Ok(DispatchOutcome::Gone)
    }

    /// Verifies every signature against the active investigators and checks
    /// the action's operations against the ACL.
    async fn authorize(&self, action: &Action) -> Result<Vec<String>, CoordinatorError> {
        let investigators = self.ctx.repos.investigators.active_investigators().await?;
        let keyring = Ed25519PublicKeyring::from_investigators(&investigators);
        let fingerprints = verify_acl(
            action,
            &self.ctx.acl,
            &keyring,
            self.ctx.config.signing.only_verify_pubkey,
        )?;
        Ok(fingerprints)
    }

    async fn store_signatures(&self, action: &Action, fingerprints: &[String]) -> Result<(), CoordinatorError> {
        for (fingerprint, signature) in fingerprints.iter().zip(&action.signatures) {
            match self
                .ctx
                .repos
                .investigators
                .investigator_by_fingerprint(fingerprint)
                .await?
            {
                Some(investigator) => {
                    self.ctx
                        .repos
                        .actions
                        .insert_signature(action.id, investigator.id, signature)
                        .await?
                }
                None => warn!(action_id = %action.id, fingerprint = %fingerprint, "signer is not a known investigator"),
            }
        }
        Ok(())
    }

    /// Records the action in `action/inflight/`, drops the origin file and
    /// persists the new state.
    async fn fly_action(&self, action: &Action, origin: &Path) -> Result<(), CoordinatorError> {
        self.ctx.spool.write_action(SpoolDir::ActionInflight, action).await?;
        self.ctx.spool.remove(origin).await?;
        if !self.ctx.repos.actions.update_action(action).await? {
            debug!(action_id = %action.id, "action already finalized by another coordinator");
        }
        Ok(())
    }

    /// Moves the action to `action/invalid/` and records it as invalid.
    pub async fn invalidate(
        &self,
        mut action: Action,
        origin: &Path,
        reason: &str,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        let now = Utc::now();
        warn!(action_id = %action.id, name = %action.name, reason, "invalidating action");

        action.transition(ActionStatus::Invalid)?;
        action.last_update_time = Some(now);
        action.finish_time = Some(now);
        action.counters.sent = 0;

        self.ctx.spool.write_action(SpoolDir::ActionInvalid, &action).await?;
        self.ctx.spool.remove(origin).await?;
        self.record_invalid(&action).await?;

        metrics::counter!("mig_actions_invalid_total").increment(1);
        self.ctx
            .notify(CoordinatorEvent::ActionInvalid {
                action_id: action.id,
                reason: reason.to_string(),
                at: now,
            })
            .await;
        Ok(DispatchOutcome::Invalid {
            reason: reason.to_string(),
        })
    }

    async fn record_invalid(&self, action: &Action) -> Result<(), CoordinatorError> {
        if self.ctx.repos.actions.update_action(action).await? {
            return Ok(());
        }
        match self.ctx.repos.actions.action_by_id(action.id).await? {
            None => {
                self.ctx.repos.actions.insert_or_update_action(action).await?;
            }
            Some(stored) => {
                debug!(action_id = %action.id, status = %stored.status, "action already terminal in store");
            }
        }
        Ok(())
    }

    /// Writes each command to `command/inflight/` and publishes it to its
    /// agent's queue with a time to live equal to the action's remaining
    /// validity. Running out of publish attempts is fatal.
    pub async fn send_commands(&self, commands: Vec<Command>) -> Result<usize, CoordinatorError> {
        let mut sent = 0;
        for command in commands {
            let now = Utc::now();
            self.ctx.spool.write_command(SpoolDir::CommandInflight, &command).await?;

            let ttl = time_to_live(&command.action, now);
            let queue = agent_queue(&command.agent.queue_loc);
            let message = Message::json(command.to_json()?).with_expiration(ttl);
            publish_with_retry(
                self.ctx.broker.as_ref(),
                Exchange::ToAgents,
                &queue,
                message,
                self.ctx.config.broker.publish_retries,
            )
            .await
            .map_err(|e| {
                CoordinatorError::Fatal(format!(
                    "publishing command {} of action {} to {} failed: {}",
                    command.id, command.action.id, queue, e
                ))
            })?;

            debug!(action_id = %command.action.id, command_id = %command.id, queue = %queue, "command published");
            metrics::counter!("mig_commands_sent_total").increment(1);
            sent += 1;
        }
        Ok(sent)
    }

    /// Consumes new action paths one at a time until cancelled.
    pub async fn run(self, mut rx: tokio::sync::mpsc::Receiver<PathBuf>, cancel: CancellationToken) {
        loop {
            let path = tokio::select! {
                received = rx.recv() => match received {
                    Some(path) => path,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            match self.process_new_action(&path).await {
                Ok(DispatchOutcome::Dispatched { commands, .. }) => {
                    for command in commands {
                        if self.ctx.channels.command_ready.send(command).await.is_err() {
                            warn!("command ready channel closed");
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, kind = ?e.kind(), "failed to process new action"),
            }
        }
        debug!("dispatcher stopped");
    }
}

fn time_to_live(action: &Action, now: DateTime<Utc>) -> std::time::Duration {
    action.remaining_validity(now).to_std().unwrap_or_default()
}
