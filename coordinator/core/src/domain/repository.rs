// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root: one repository per
//! aggregate, interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ActionRepository` | `Action` | `InMemoryStore`, `PostgresActionRepository` |
//! | `CommandRepository` | `Command` | `InMemoryStore`, `PostgresCommandRepository` |
//! | `AgentRepository` | `Agent` | `InMemoryStore`, `PostgresAgentRepository` |
//! | `InvestigatorRepository` | `Investigator` | `InMemoryStore`, `PostgresInvestigatorRepository` |
//! | `AgentStatsRepository` | `AgentsStats` | `InMemoryStore`, `PostgresAgentStatsRepository` |
//!
//! ## Concurrency contract
//!
//! Several coordinators may share one store. Every exclusive transition is a
//! conditional update; methods returning `bool` report whether this caller's
//! write took effect. `false` means a peer already moved the row and is not
//! an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::action::{Action, ActionCounters, ActionId};
use crate::domain::agent::{Agent, AgentId, AgentStatus, AgentsStats, AgentsVersionsSum};
use crate::domain::command::{Command, CommandId};
use crate::domain::investigator::{Investigator, InvestigatorId};

/// What [`ActionRepository::insert_or_update_action`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionUpsert {
    Inserted,
    Updated,
    /// The stored action is already in flight or final; nothing was written.
    Unchanged,
}

#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Flips `pending` actions whose window contains `now` to `scheduled`
    /// and returns them. Each action is returned to exactly one caller.
    async fn schedule_ready_actions(&self, now: DateTime<Utc>) -> Result<Vec<Action>, RepositoryError>;

    /// Inserts the action, or updates it if the id already exists and the
    /// stored copy has not been dispatched yet.
    async fn insert_or_update_action(&self, action: &Action) -> Result<ActionUpsert, RepositoryError>;

    /// Persists status, timestamps and counters of a non-terminal action.
    /// Returns `false` if the stored action is already done or invalid.
    async fn update_action(&self, action: &Action) -> Result<bool, RepositoryError>;

    /// Persists counters and last update time of an in-flight action.
    async fn update_running_action(&self, action: &Action) -> Result<bool, RepositoryError>;

    /// Marks an in-flight action done. Returns `false` if it was not in flight.
    async fn finish_action(&self, action: &Action) -> Result<bool, RepositoryError>;

    async fn action_by_id(&self, id: ActionId) -> Result<Option<Action>, RepositoryError>;

    async fn insert_signature(
        &self,
        action_id: ActionId,
        investigator_id: InvestigatorId,
        signature: &str,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// Inserts commands in bulk. Existing ids are left untouched.
    async fn insert_commands(&self, commands: &[Command]) -> Result<u64, RepositoryError>;

    /// Records the returned status, results and finish time.
    ///
    /// Refuses to overwrite a command already marked `success`, and only
    /// accepts results from the agent instance the command was sent to.
    async fn finish_command(&self, command: &Command) -> Result<bool, RepositoryError>;

    /// Grouped count of command statuses for one action.
    async fn action_counters(&self, action_id: ActionId) -> Result<ActionCounters, RepositoryError>;

    async fn command_by_id(&self, id: CommandId) -> Result<Option<Command>, RepositoryError>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Online or idle agents matching `target`, one per queue location,
    /// resolved in a read-only transaction.
    async fn active_agents_by_target(&self, target: &str) -> Result<Vec<Agent>, RepositoryError>;

    async fn agent_by_queue_and_pid(&self, queue_loc: &str, pid: i64) -> Result<Option<Agent>, RepositoryError>;

    async fn insert_agent(&self, agent: &Agent) -> Result<(), RepositoryError>;

    /// Sets the agent online with a fresh heartbeat time. Destroyed agents
    /// are left untouched.
    async fn update_agent_heartbeat(&self, agent: &Agent) -> Result<(), RepositoryError>;

    /// Marks `previous` offline and inserts `agent` in its place, atomically.
    /// Used when a heartbeat carries newer environment data.
    async fn replace_refreshed_agent(&self, previous: AgentId, agent: &Agent) -> Result<(), RepositoryError>;

    /// `idle` agents silent since before `cutoff` become `offline`.
    async fn mark_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    /// `online` agents silent since before `cutoff` become `idle`.
    async fn mark_idle_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn mark_agent_destroyed(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// Queue locations with more than one non-checkin agent heard since `since`.
    async fn list_multi_agents_queues(&self, since: DateTime<Utc>) -> Result<Vec<String>, RepositoryError>;

    /// Non-offline agents on `queue_loc` heard since `since`.
    async fn active_agents_by_queue(
        &self,
        queue_loc: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Agent>, RepositoryError>;

    /// Queue locations of offline agents heard after `oldest` that have no
    /// online or idle instance left.
    async fn disappeared_endpoints(&self, oldest: DateTime<Utc>) -> Result<Vec<String>, RepositoryError>;

    async fn sum_agents_by_version(&self, status: AgentStatus) -> Result<Vec<AgentsVersionsSum>, RepositoryError>;

    async fn count_endpoints(&self, status: AgentStatus) -> Result<i64, RepositoryError>;

    /// Endpoints first seen after `recent` that were not seen between `old`
    /// and `recent`.
    async fn count_new_endpoints(&self, recent: DateTime<Utc>, old: DateTime<Utc>) -> Result<i64, RepositoryError>;

    async fn count_double_agents(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError>;

    async fn count_disappeared_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError>;

    async fn count_flapping_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError>;
}

#[async_trait]
pub trait InvestigatorRepository: Send + Sync {
    async fn investigator_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Investigator>, RepositoryError>;

    async fn active_investigators(&self) -> Result<Vec<Investigator>, RepositoryError>;

    async fn insert_investigator(&self, investigator: &Investigator) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AgentStatsRepository: Send + Sync {
    async fn store_agents_stats(&self, stats: &AgentsStats) -> Result<(), RepositoryError>;

    async fn latest_agents_stats(&self) -> Result<Option<AgentsStats>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
