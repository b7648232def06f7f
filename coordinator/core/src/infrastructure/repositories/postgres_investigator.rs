// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! PostgreSQL `InvestigatorRepository` over the `investigators` table.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::investigator::{Investigator, InvestigatorId, InvestigatorStatus, Permissions};
use crate::domain::repository::{InvestigatorRepository, RepositoryError};

const INVESTIGATOR_COLUMNS: &str =
    "id, name, pgpfingerprint, publickey, status, createdat, lastmodified, permissions";

fn investigator_from_row(row: &PgRow) -> Investigator {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    let public_key: Option<String> = row.get("publickey");
    Investigator {
        id: InvestigatorId(id as u64),
        name: row.get("name"),
        fingerprint: row.get("pgpfingerprint"),
        public_key: public_key.unwrap_or_default(),
        status: InvestigatorStatus::parse(&status),
        created_at: row.get("createdat"),
        last_modified: row.get("lastmodified"),
        permissions: Permissions(row.get("permissions")),
    }
}

pub struct PostgresInvestigatorRepository {
    pool: PgPool,
}

impl PostgresInvestigatorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvestigatorRepository for PostgresInvestigatorRepository {
    async fn investigator_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Investigator>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM investigators WHERE UPPER(pgpfingerprint) = UPPER($1)",
            INVESTIGATOR_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Error while finding investigator: {}", e)))?;

        Ok(row.as_ref().map(investigator_from_row))
    }

    async fn active_investigators(&self) -> Result<Vec<Investigator>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM investigators WHERE status = 'active' ORDER BY id",
            INVESTIGATOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(rows.iter().map(investigator_from_row).collect())
    }

    async fn insert_investigator(&self, investigator: &Investigator) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO investigators (id, name, pgpfingerprint, publickey, status, createdat, lastmodified, permissions)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(investigator.id.0 as i64)
        .bind(&investigator.name)
        .bind(&investigator.fingerprint)
        .bind(&investigator.public_key)
        .bind(investigator.status.as_str())
        .bind(investigator.created_at)
        .bind(investigator.last_modified)
        .bind(investigator.permissions.0)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert investigator {}: {}", investigator.name, e)))?;
        Ok(())
    }
}
