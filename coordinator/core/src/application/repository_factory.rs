// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Builds the set of repositories the coordinator runs against: one
//! PostgreSQL repository per aggregate when a database is configured, or a
//! single shared [`InMemoryStore`] otherwise.

use std::sync::Arc;

use sqlx::PgPool;

use crate::domain::repository::{
    ActionRepository, AgentRepository, AgentStatsRepository, CommandRepository, InvestigatorRepository,
};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::postgres_action::PostgresActionRepository;
use crate::infrastructure::repositories::postgres_agent::PostgresAgentRepository;
use crate::infrastructure::repositories::postgres_command::PostgresCommandRepository;
use crate::infrastructure::repositories::postgres_investigator::PostgresInvestigatorRepository;
use crate::infrastructure::repositories::postgres_stats::PostgresAgentStatsRepository;
use crate::infrastructure::repositories::InMemoryStore;

#[derive(Clone)]
pub struct Repositories {
    pub actions: Arc<dyn ActionRepository>,
    pub commands: Arc<dyn CommandRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub investigators: Arc<dyn InvestigatorRepository>,
    pub stats: Arc<dyn AgentStatsRepository>,
}

impl Repositories {
    /// Every trait served by the same store.
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            actions: store.clone(),
            commands: store.clone(),
            agents: store.clone(),
            investigators: store.clone(),
            stats: store,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            actions: Arc::new(PostgresActionRepository::new(pool.clone())),
            commands: Arc::new(PostgresCommandRepository::new(pool.clone())),
            agents: Arc::new(PostgresAgentRepository::new(pool.clone())),
            investigators: Arc::new(PostgresInvestigatorRepository::new(pool.clone())),
            stats: Arc::new(PostgresAgentStatsRepository::new(pool)),
        }
    }

    /// Creates repositories for the configured backend.
    pub fn create(database: Option<&Database>) -> Self {
        match database {
            Some(db) => Self::postgres(db.get_pool().clone()),
            None => Self::in_memory(Arc::new(InMemoryStore::new())),
        }
    }
}
