// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the persistence traits defined in
//! `crate::domain::repository`.
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! Backed by the shared MIG schema:
//! - **PostgresActionRepository** - `actions` and `signatures`
//! - **PostgresCommandRepository** - `commands`
//! - **PostgresAgentRepository** - `agents`, including read-only target resolution
//! - **PostgresInvestigatorRepository** - `investigators`
//! - **PostgresAgentStatsRepository** - `agents_stats`
//!
//! ## In-Memory Store
//!
//! - **InMemoryStore** - one lock-protected store implementing all five
//!   traits, with targets evaluated by [`target::TargetFilter`]
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo(database_url: &str) -> anyhow::Result<()> {
//! use mig_coordinator_core::domain::repository::AgentRepository;
//! use mig_coordinator_core::infrastructure::repositories::postgres_agent::PostgresAgentRepository;
//!
//! let pool = sqlx::PgPool::connect(database_url).await?;
//! let repo = PostgresAgentRepository::new(pool);
//! let agents = repo.active_agents_by_target("environment->>'os'='linux'").await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod postgres_action;
pub mod postgres_agent;
pub mod postgres_command;
pub mod postgres_investigator;
pub mod postgres_stats;
pub mod target;

pub use memory::InMemoryStore;
