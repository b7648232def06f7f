// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! handed to every PostgreSQL repository. The coordinator shares the MIG
//! schema (`actions`, `commands`, `agents`, `investigators`,
//! `signatures`, `agents_stats`) with the API and the workers.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::domain::scheduler_config::DatabaseConfig;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .context("failed to connect to the database")?;

        Ok(Self { pool })
    }

    /// Connects using the `database` section of the coordinator config.
    /// Returns `None` when no URL is configured.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Option<Self>> {
        match config.url.as_deref() {
            Some(url) => Ok(Some(Self::new(url, config.max_connections).await?)),
            None => Ok(None),
        }
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
