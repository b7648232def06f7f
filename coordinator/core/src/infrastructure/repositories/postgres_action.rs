// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Action Repository
//!
//! `ActionRepository` backed by the `actions` and `signatures` tables.
//! Every status change is a conditional `UPDATE`; the affected row count
//! tells the caller whether it won the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::action::{Action, ActionCounters, ActionId, ActionStatus, Description, Operation, Threat};
use crate::domain::investigator::InvestigatorId;
use crate::domain::repository::{ActionRepository, ActionUpsert, RepositoryError};

pub(super) const ACTION_COLUMNS: &str = "actions.id, actions.name, actions.target, actions.description, \
     actions.threat, actions.operations, actions.validfrom, actions.expireafter, actions.starttime, \
     actions.finishtime, actions.lastupdatetime, actions.status, actions.pgpsignatures, \
     actions.syntaxversion, actions.counters";

pub(super) fn action_from_row(row: &PgRow) -> Result<Action, RepositoryError> {
    let id: i64 = row.get("id");
    let description: serde_json::Value = row.get("description");
    let threat: serde_json::Value = row.get("threat");
    let operations: serde_json::Value = row.get("operations");
    let signatures: serde_json::Value = row.get("pgpsignatures");
    let counters: Option<serde_json::Value> = row.get("counters");
    let status: String = row.get("status");
    let syntax_version: i32 = row.get("syntaxversion");

    Ok(Action {
        id: ActionId(id as u64),
        name: row.get("name"),
        target: row.get("target"),
        description: serde_json::from_value::<Description>(description)?,
        threat: serde_json::from_value::<Threat>(threat)?,
        valid_from: row.get("validfrom"),
        expire_after: row.get("expireafter"),
        operations: serde_json::from_value::<Vec<Operation>>(operations)?,
        signatures: serde_json::from_value::<Vec<String>>(signatures)?,
        investigators: Vec::new(),
        status: status
            .parse::<ActionStatus>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        start_time: row.get("starttime"),
        finish_time: row.get("finishtime"),
        last_update_time: row.get("lastupdatetime"),
        counters: match counters {
            Some(v) => serde_json::from_value::<ActionCounters>(v)?,
            None => ActionCounters::default(),
        },
        syntax_version: syntax_version as u16,
    })
}

pub struct PostgresActionRepository {
    pool: PgPool,
}

impl PostgresActionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActionRepository for PostgresActionRepository {
    async fn schedule_ready_actions(&self, now: DateTime<Utc>) -> Result<Vec<Action>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE actions SET status = 'scheduled'
            WHERE status = 'pending' AND validfrom < $1 AND expireafter > $1
            RETURNING {}
            "#,
            ACTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to schedule runnable actions: {}", e)))?;

        rows.iter().map(action_from_row).collect()
    }

    async fn insert_or_update_action(&self, action: &Action) -> Result<ActionUpsert, RepositoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO actions (
                id, name, target, description, threat, operations,
                validfrom, expireafter, starttime, finishtime, lastupdatetime,
                status, pgpsignatures, syntaxversion, counters
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                starttime = EXCLUDED.starttime,
                finishtime = EXCLUDED.finishtime,
                lastupdatetime = EXCLUDED.lastupdatetime,
                status = EXCLUDED.status,
                counters = EXCLUDED.counters
            WHERE actions.status IN ('pending', 'scheduled', 'preparing')
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(action.id.0 as i64)
        .bind(&action.name)
        .bind(&action.target)
        .bind(serde_json::to_value(&action.description)?)
        .bind(serde_json::to_value(&action.threat)?)
        .bind(serde_json::to_value(&action.operations)?)
        .bind(action.valid_from)
        .bind(action.expire_after)
        .bind(action.start_time)
        .bind(action.finish_time)
        .bind(action.last_update_time)
        .bind(action.status.as_str())
        .bind(serde_json::to_value(&action.signatures)?)
        .bind(action.syntax_version as i32)
        .bind(serde_json::to_value(action.counters)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save action {}: {}", action.id, e)))?;

        // no row back: the conflict guard kept a dispatched action untouched
        Ok(match row {
            None => ActionUpsert::Unchanged,
            Some(row) if row.get::<bool, _>("inserted") => ActionUpsert::Inserted,
            Some(_) => ActionUpsert::Updated,
        })
    }

    async fn update_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE actions SET
                status = $2, starttime = $3, expireafter = $4, finishtime = $5,
                lastupdatetime = $6, counters = $7
            WHERE id = $1 AND status NOT IN ('done', 'invalid')
            "#,
        )
        .bind(action.id.0 as i64)
        .bind(action.status.as_str())
        .bind(action.start_time)
        .bind(action.expire_after)
        .bind(action.finish_time)
        .bind(action.last_update_time)
        .bind(serde_json::to_value(action.counters)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to update action {}: {}", action.id, e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_running_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE actions SET lastupdatetime = $2, counters = $3
            WHERE id = $1 AND status = 'inflight'
            "#,
        )
        .bind(action.id.0 as i64)
        .bind(action.last_update_time)
        .bind(serde_json::to_value(action.counters)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE actions SET status = 'done', finishtime = $2, lastupdatetime = $3, counters = $4
            WHERE id = $1 AND status = 'inflight'
            "#,
        )
        .bind(action.id.0 as i64)
        .bind(action.finish_time)
        .bind(action.last_update_time)
        .bind(serde_json::to_value(action.counters)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn action_by_id(&self, id: ActionId) -> Result<Option<Action>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM actions WHERE id = $1", ACTION_COLUMNS))
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(action_from_row).transpose()
    }

    async fn insert_signature(
        &self,
        action_id: ActionId,
        investigator_id: InvestigatorId,
        signature: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO signatures (actionid, investigatorid, pgpsignature)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(action_id.0 as i64)
        .bind(investigator_id.0 as i64)
        .bind(signature)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to store signature of action {}: {}", action_id, e)))?;

        Ok(())
    }
}
