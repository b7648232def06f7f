// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::agent::{AgentsStats, AgentsVersionsSum};
use crate::domain::repository::{AgentStatsRepository, RepositoryError};

/// Fleet statistics snapshots in the `agents_stats` table.
pub struct PostgresAgentStatsRepository {
    pool: PgPool,
}

impl PostgresAgentStatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentStatsRepository for PostgresAgentStatsRepository {
    async fn store_agents_stats(&self, stats: &AgentsStats) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO agents_stats (
                timestamp, online_agents, online_agents_by_version, online_endpoints,
                idle_agents, idle_agents_by_version, idle_endpoints, new_endpoints,
                multi_agents_endpoints, disappeared_endpoints, flapping_endpoints
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(stats.timestamp)
        .bind(stats.online_agents)
        .bind(serde_json::to_value(&stats.online_agents_by_version)?)
        .bind(stats.online_endpoints)
        .bind(stats.idle_agents)
        .bind(serde_json::to_value(&stats.idle_agents_by_version)?)
        .bind(stats.idle_endpoints)
        .bind(stats.new_endpoints)
        .bind(stats.multi_agents_endpoints)
        .bind(stats.disappeared_endpoints)
        .bind(stats.flapping_endpoints)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert agent statistics: {}", e)))?;
        Ok(())
    }

    async fn latest_agents_stats(&self) -> Result<Option<AgentsStats>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT timestamp, online_agents, online_agents_by_version, online_endpoints,
                   idle_agents, idle_agents_by_version, idle_endpoints, new_endpoints,
                   multi_agents_endpoints, disappeared_endpoints, flapping_endpoints
            FROM agents_stats ORDER BY timestamp DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let online_by_version: serde_json::Value = row.get("online_agents_by_version");
        let idle_by_version: serde_json::Value = row.get("idle_agents_by_version");
        Ok(Some(AgentsStats {
            timestamp: row.get("timestamp"),
            online_agents: row.get("online_agents"),
            online_agents_by_version: serde_json::from_value::<Vec<AgentsVersionsSum>>(online_by_version)?,
            online_endpoints: row.get("online_endpoints"),
            idle_agents: row.get("idle_agents"),
            idle_agents_by_version: serde_json::from_value::<Vec<AgentsVersionsSum>>(idle_by_version)?,
            idle_endpoints: row.get("idle_endpoints"),
            new_endpoints: row.get("new_endpoints"),
            multi_agents_endpoints: row.get("multi_agents_endpoints"),
            disappeared_endpoints: row.get("disappeared_endpoints"),
            flapping_endpoints: row.get("flapping_endpoints"),
        }))
    }
}
