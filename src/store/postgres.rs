//! Postgres-backed work store.
//!
//! Expects two tables (migrations are owned by the CRUD layer):
//!
//! | Table | Columns |
//! |---|---|
//! | `applications` | `id uuid pk`, `status text`, `subject_ref text`, `target_ref text`, `artifacts jsonb null`, `processing_meta jsonb not null default '{}'`, `created_at timestamptz`, `updated_at timestamptz` |
//! | `input_documents` | `reference text pk`, `body text` |
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction, so
//! concurrent dispatchers never see the same row; commits are conditional
//! on the claim token stored in `processing_meta`. A claimable row whose
//! JSON columns do not decode is marked `failed` instead of blocking the
//! queue.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, WorkStore};
use crate::state_machine::{ApplicationStatus, Artifacts, ProcessingMeta, WorkItem};

const COLUMNS: &str =
    "id, status, subject_ref, target_ref, artifacts, processing_meta, created_at, updated_at";

/// JSON columns are fetched untyped and decoded per row, so one bad row
/// cannot fail a whole query.
#[derive(Debug, sqlx::FromRow)]
struct ApplicationRow {
    id: Uuid,
    status: String,
    subject_ref: String,
    target_ref: String,
    artifacts: Option<Json<Value>>,
    processing_meta: Json<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ApplicationRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |message: String| StoreError::Corrupt { id, message };
        let status = row
            .status
            .parse::<ApplicationStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let artifacts = row
            .artifacts
            .map(|Json(value)| serde_json::from_value::<Artifacts>(value))
            .transpose()
            .map_err(|e| corrupt(format!("artifacts: {e}")))?;
        let meta = serde_json::from_value::<ProcessingMeta>(row.processing_meta.0)
            .map_err(|e| corrupt(format!("processing_meta: {e}")))?;
        Ok(WorkItem {
            id,
            status,
            subject_ref: row.subject_ref,
            target_ref: row.target_ref,
            artifacts,
            meta,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "Connected to work store");
        Ok(Self::new(pool))
    }
}

/// Park an undecodable row in `failed` with the decode error, outside the
/// dispatcher's reach.
async fn fail_corrupt(
    tx: &mut sqlx::PgConnection,
    id: Uuid,
    error: &StoreError,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let meta = ProcessingMeta {
        last_error: Some(error.to_string()),
        terminal_reason: Some("undecodable work item".to_string()),
        completed_at: Some(now),
        ..ProcessingMeta::default()
    };
    sqlx::query(
        "UPDATE applications SET status = $2, processing_meta = $3, updated_at = $4 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(ApplicationStatus::Failed.as_str())
    .bind(Json(&meta))
    .bind(now)
    .execute(tx)
    .await?;
    Ok(())
}

impl WorkStore for PgStore {
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {COLUMNS} FROM applications \
             WHERE status = $1 \
                OR (status = $2 AND (processing_meta->>'claimed_at' IS NULL \
                     OR (processing_meta->>'claimed_at')::timestamptz < $3)) \
             ORDER BY created_at ASC \
             LIMIT $4 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(ApplicationStatus::Queued.as_str())
            .bind(ApplicationStatus::Processing.as_str())
            .bind(stale_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let mut item = match WorkItem::try_from(row) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(%id, error = %e, "Undecodable work item; marking it failed");
                    fail_corrupt(&mut *tx, id, &e, now).await?;
                    continue;
                }
            };
            item.claim(Uuid::new_v4(), now)?;
            sqlx::query(
                "UPDATE applications SET status = $2, processing_meta = $3, updated_at = $4 \
                 WHERE id = $1",
            )
            .bind(item.id)
            .bind(item.status.as_str())
            .bind(Json(&item.meta))
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await?;
            claimed.push(item);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn resolve_content(&self, reference: &str) -> Result<String, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT body FROM input_documents WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::MissingContent(reference.to_string()))
    }

    async fn commit(&self, item: &WorkItem, token: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE applications \
             SET status = $2, artifacts = $3, processing_meta = $4, updated_at = $5 \
             WHERE id = $1 AND status = $6 AND processing_meta->>'claim_token' = $7",
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(item.artifacts.as_ref().map(Json))
        .bind(Json(&item.meta))
        .bind(item.updated_at)
        .bind(ApplicationStatus::Processing.as_str())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimLost(item.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM applications WHERE id = $1");
        sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkItem::try_from)
            .transpose()
    }
}
