// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Command Repository
//!
//! `CommandRepository` backed by the `commands` table. Commands reference
//! their action and agent by id; reads join them back into a full
//! [`Command`].

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{QueryBuilder, Row};

use super::postgres_action::{action_from_row, ACTION_COLUMNS};
use super::postgres_agent::{agent_from_row, AGENT_COLUMNS};
use crate::domain::action::{ActionCounters, ActionId};
use crate::domain::command::{Command, CommandId, CommandStatus, ModuleResult};
use crate::domain::repository::{CommandRepository, RepositoryError};

/// Rows per multi-row `INSERT`. Keeps each statement under the bind limit.
const INSERT_CHUNK: usize = 1000;

/// Postgres rejects `\u0000` inside `jsonb`; agents occasionally send it.
fn sanitize_results(results: &[ModuleResult]) -> Result<serde_json::Value, RepositoryError> {
    let raw = serde_json::to_string(results)?;
    let cleaned = raw.replace("\\u0000", "NULL");
    Ok(serde_json::from_str(&cleaned)?)
}

pub struct PostgresCommandRepository {
    pool: PgPool,
}

impl PostgresCommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandRepository for PostgresCommandRepository {
    async fn insert_commands(&self, commands: &[Command]) -> Result<u64, RepositoryError> {
        let mut inserted = 0;
        for chunk in commands.chunks(INSERT_CHUNK) {
            let mut results = Vec::with_capacity(chunk.len());
            for cmd in chunk {
                results.push(sanitize_results(&cmd.results)?);
            }

            let mut builder = QueryBuilder::new(
                "INSERT INTO commands (id, actionid, agentid, status, results, starttime, finishtime) ",
            );
            builder.push_values(chunk.iter().zip(results), |mut b, (cmd, res)| {
                b.push_bind(cmd.id.0 as i64)
                    .push_bind(cmd.action.id.0 as i64)
                    .push_bind(cmd.agent.id.0 as i64)
                    .push_bind(cmd.status.as_str())
                    .push_bind(res)
                    .push_bind(cmd.start_time)
                    .push_bind(cmd.finish_time);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to insert commands: {}", e)))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn finish_command(&self, command: &Command) -> Result<bool, RepositoryError> {
        let results = sanitize_results(&command.results)?;
        let result = sqlx::query(
            r#"
            UPDATE commands SET status = $1, results = $2, finishtime = $3
            WHERE id = $4 AND status != 'success' AND $1 <> 'sent' AND agentid IN (
                SELECT id FROM agents
                WHERE agents.queueloc = $5 AND agents.pid = $6 AND status IN ('online', 'idle')
            )
            "#,
        )
        .bind(command.status.as_str())
        .bind(results)
        .bind(command.finish_time)
        .bind(command.id.0 as i64)
        .bind(&command.agent.queue_loc)
        .bind(command.agent.pid)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Error while updating command {}: {}", command.id, e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn action_counters(&self, action_id: ActionId) -> Result<ActionCounters, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(id) AS count FROM commands WHERE actionid = $1 GROUP BY status")
            .bind(action_id.0 as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Error while retrieving counters: {}", e)))?;

        let mut counters = ActionCounters::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let status = CommandStatus::parse(&status).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
            counters.sent += count;
            match status {
                CommandStatus::Sent => counters.inflight = count,
                CommandStatus::Success => counters.success = count,
                CommandStatus::Cancelled => counters.cancelled = count,
                CommandStatus::Expired => counters.expired = count,
                CommandStatus::Failed => counters.failed = count,
                CommandStatus::Timeout => counters.timeout = count,
            }
            if status.is_terminal() {
                counters.done += count;
            }
        }
        Ok(counters)
    }

    async fn command_by_id(&self, id: CommandId) -> Result<Option<Command>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT status AS cmdstatus, results, starttime AS cmdstarttime, finishtime AS cmdfinishtime
            FROM commands WHERE id = $1
            "#,
        )
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let action_row = sqlx::query(&format!(
            "SELECT {} FROM actions JOIN commands ON commands.actionid = actions.id WHERE commands.id = $1",
            ACTION_COLUMNS
        ))
        .bind(id.0 as i64)
        .fetch_one(&self.pool)
        .await?;
        let agent_row = sqlx::query(&format!(
            "SELECT {} FROM agents JOIN commands ON commands.agentid = agents.id WHERE commands.id = $1",
            AGENT_COLUMNS
        ))
        .bind(id.0 as i64)
        .fetch_one(&self.pool)
        .await?;

        let status: String = row.get("cmdstatus");
        let results: Option<serde_json::Value> = row.get("results");
        Ok(Some(Command {
            id,
            agent: agent_from_row(&agent_row)?,
            action: action_from_row(&action_row)?,
            compressed_action: None,
            status: CommandStatus::parse(&status).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            results: match results {
                Some(v) => serde_json::from_value(v)?,
                None => Vec::new(),
            },
            compressed_results: Vec::new(),
            start_time: row.get("cmdstarttime"),
            finish_time: row.get("cmdfinishtime"),
        }))
    }
}
