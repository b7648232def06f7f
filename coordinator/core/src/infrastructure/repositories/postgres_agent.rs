// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Agent Repository
//!
//! `AgentRepository` backed by the `agents` table. Target resolution pastes
//! the investigator-supplied expression into the `WHERE` clause, so it runs
//! in a transaction under the `migreadonly` role.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::agent::{Agent, AgentEnv, AgentId, AgentStatus, AgentsVersionsSum};
use crate::domain::repository::{AgentRepository, RepositoryError};

const READONLY_ROLE: &str = "migreadonly";

pub(super) const AGENT_COLUMNS: &str = "agents.id, agents.name, agents.queueloc, agents.mode, \
     agents.version, agents.pid, agents.starttime, agents.destructiontime, agents.heartbeattime, \
     agents.refreshtime, agents.status, agents.environment, agents.tags";

pub(super) fn agent_from_row(row: &PgRow) -> Result<Agent, RepositoryError> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    let environment: Option<serde_json::Value> = row.get("environment");
    let tags: Option<serde_json::Value> = row.get("tags");

    Ok(Agent {
        id: AgentId(id as u64),
        name: row.get("name"),
        queue_loc: row.get("queueloc"),
        mode: row.get("mode"),
        version: row.get("version"),
        pid: row.get("pid"),
        start_time: row.get("starttime"),
        destruction_time: row.get("destructiontime"),
        heartbeat_ts: row.get("heartbeattime"),
        refresh_ts: row.get("refreshtime"),
        status: AgentStatus::parse(&status).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        authorized: false,
        env: match environment {
            Some(v) => serde_json::from_value::<AgentEnv>(v)?,
            None => AgentEnv::default(),
        },
        tags: tags.unwrap_or(serde_json::Value::Null),
        loader_name: String::new(),
    })
}

pub struct PostgresAgentRepository {
    pool: PgPool,
}

impl PostgresAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &str, binds: &[DateTime<Utc>], status: &[&str]) -> Result<i64, RepositoryError> {
        let mut query = sqlx::query(sql);
        for s in status {
            query = query.bind(*s);
        }
        for t in binds {
            query = query.bind(*t);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(row.get::<i64, _>(0))
    }
}

async fn insert_agent_with<'e, E>(executor: E, agent: &Agent) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO agents (
            id, name, queueloc, mode, version, pid, starttime, destructiontime,
            heartbeattime, refreshtime, status, environment, tags
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(agent.id.0 as i64)
    .bind(&agent.name)
    .bind(&agent.queue_loc)
    .bind(&agent.mode)
    .bind(&agent.version)
    .bind(agent.pid)
    .bind(agent.start_time)
    .bind(agent.destruction_time)
    .bind(agent.heartbeat_ts)
    .bind(agent.refresh_ts)
    .bind(agent.status.as_str())
    .bind(serde_json::to_value(&agent.env)?)
    .bind(serde_json::to_value(&agent.tags)?)
    .execute(executor)
    .await
    .map_err(|e| RepositoryError::Database(format!("Failed to insert agent {}: {}", agent.queue_loc, e)))?;
    Ok(())
}

#[async_trait]
impl AgentRepository for PostgresAgentRepository {
    async fn active_agents_by_target(&self, target: &str) -> Result<Vec<Agent>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let current_user: String = sqlx::query_scalar("SELECT CURRENT_USER")
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(&format!("SET ROLE {}", READONLY_ROLE))
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT ON (queueloc) {}
            FROM agents
            WHERE agents.status IN ('online', 'idle') AND ({})
            ORDER BY agents.queueloc ASC, agents.heartbeattime DESC
            "#,
            AGENT_COLUMNS, target
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Error while finding agents: {}", e)))?;

        sqlx::query(&format!("SET ROLE \"{}\"", current_user.replace('"', "\"\"")))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn agent_by_queue_and_pid(&self, queue_loc: &str, pid: i64) -> Result<Option<Agent>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE queueloc = $1 AND pid = $2 ORDER BY heartbeattime DESC LIMIT 1",
            AGENT_COLUMNS
        ))
        .bind(queue_loc)
        .bind(pid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(agent_from_row).transpose()
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), RepositoryError> {
        insert_agent_with(&self.pool, agent).await
    }

    async fn update_agent_heartbeat(&self, agent: &Agent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE agents SET status = 'online', heartbeattime = $2
            WHERE id = $1 AND status != 'destroyed'
            "#,
        )
        .bind(agent.id.0 as i64)
        .bind(agent.heartbeat_ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to update agent heartbeat: {}", e)))?;
        Ok(())
    }

    async fn replace_refreshed_agent(&self, previous: AgentId, agent: &Agent) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE agents SET status = 'offline' WHERE id = $1")
            .bind(previous.0 as i64)
            .execute(&mut *tx)
            .await?;
        insert_agent_with(&mut *tx, agent).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("UPDATE agents SET status = 'offline' WHERE heartbeattime < $1 AND status = 'idle'")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_idle_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("UPDATE agents SET status = 'idle' WHERE heartbeattime < $1 AND status = 'online'")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_agent_destroyed(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE agents SET status = 'destroyed', destructiontime = $2 WHERE id = $1")
            .bind(id.0 as i64)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_multi_agents_queues(&self, since: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let queues = sqlx::query_scalar::<_, String>(
            r#"
            SELECT queueloc FROM agents
            WHERE heartbeattime > $1 AND mode != 'checkin'
            GROUP BY queueloc HAVING COUNT(queueloc) > 1
            ORDER BY queueloc
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Error while listing multi agents queues: {}", e)))?;
        Ok(queues)
    }

    async fn active_agents_by_queue(
        &self,
        queue_loc: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Agent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM agents
            WHERE heartbeattime > $1 AND queueloc = $2 AND status != 'offline'
            ORDER BY starttime ASC
            "#,
            AGENT_COLUMNS
        ))
        .bind(since)
        .bind(queue_loc)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn disappeared_endpoints(&self, oldest: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let queues = sqlx::query_scalar::<_, String>(
            r#"
            SELECT queueloc FROM agents
            WHERE status = 'offline' AND heartbeattime > $1 AND queueloc NOT IN (
                SELECT queueloc FROM agents WHERE status IN ('online', 'idle') GROUP BY queueloc
            )
            GROUP BY queueloc ORDER BY queueloc
            "#,
        )
        .bind(oldest)
        .fetch_all(&self.pool)
        .await?;
        Ok(queues)
    }

    async fn sum_agents_by_version(&self, status: AgentStatus) -> Result<Vec<AgentsVersionsSum>, RepositoryError> {
        let sql = if status == AgentStatus::Idle {
            r#"
            SELECT COUNT(*) AS count, version FROM agents
            WHERE status = $1 AND queueloc NOT IN (
                SELECT DISTINCT(queueloc) FROM agents WHERE status = 'online'
            )
            GROUP BY version ORDER BY version
            "#
        } else {
            "SELECT COUNT(*) AS count, version FROM agents WHERE status = $1 GROUP BY version ORDER BY version"
        };
        let rows = sqlx::query(sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| AgentsVersionsSum {
                version: row.get("version"),
                count: row.get("count"),
            })
            .collect())
    }

    async fn count_endpoints(&self, status: AgentStatus) -> Result<i64, RepositoryError> {
        if status == AgentStatus::Idle {
            return self
                .count(
                    r#"
                    SELECT COUNT(DISTINCT(queueloc)) FROM agents
                    WHERE status = $1 AND queueloc NOT IN (
                        SELECT queueloc FROM agents WHERE status = 'online' GROUP BY queueloc
                    )
                    "#,
                    &[],
                    &[status.as_str()],
                )
                .await;
        }
        self.count(
            "SELECT COUNT(DISTINCT(queueloc)) FROM agents WHERE status = $1",
            &[],
            &[status.as_str()],
        )
        .await
    }

    async fn count_new_endpoints(&self, recent: DateTime<Utc>, old: DateTime<Utc>) -> Result<i64, RepositoryError> {
        self.count(
            r#"
            SELECT COUNT(*) FROM (
                SELECT queueloc FROM agents
                WHERE queueloc NOT IN (
                    SELECT queueloc FROM agents
                    WHERE heartbeattime > $2 AND heartbeattime < $1
                    GROUP BY queueloc
                )
                AND starttime > $1
                GROUP BY queueloc
            ) AS newendpoints
            "#,
            &[recent, old],
            &[],
        )
        .await
    }

    async fn count_double_agents(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        self.count(
            r#"
            SELECT COUNT(*) FROM (
                SELECT queueloc FROM agents
                WHERE status = 'online' AND heartbeattime > $1
                GROUP BY queueloc HAVING COUNT(queueloc) > 1
            ) AS doubleagents
            "#,
            &[since],
            &[],
        )
        .await
    }

    async fn count_disappeared_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        self.count(
            r#"
            SELECT COUNT(*) FROM (
                SELECT queueloc FROM agents
                WHERE status = 'offline' AND heartbeattime > $1 AND queueloc NOT IN (
                    SELECT queueloc FROM agents WHERE status IN ('online', 'idle') GROUP BY queueloc
                )
                GROUP BY queueloc
            ) AS disappeared
            "#,
            &[since],
            &[],
        )
        .await
    }

    async fn count_flapping_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        self.count(
            r#"
            SELECT COUNT(*) FROM (
                SELECT queueloc FROM agents
                WHERE status IN ('online', 'idle') AND heartbeattime > $1
                GROUP BY queueloc HAVING COUNT(queueloc) > 1
            ) AS flapping
            "#,
            &[since],
            &[],
        )
        .await
    }
}
