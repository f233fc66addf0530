use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use factotum_core::domain::outbox::{AttemptKey, OutboxOutcome, OutboxRecord};
use factotum_core::domain::task::TaskId;

use super::task::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{OutboxRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, key: &AttemptKey) -> Result<Option<OutboxRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                task_id,
                attempt,
                intent_json,
                payload_hash,
                outcome,
                error,
                recorded_at,
                resolved_at
             FROM outbox_record
             WHERE task_id = ? AND attempt = ?",
        )
        .bind(&key.task_id.0)
        .bind(i64::from(key.attempt))
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn record_intent(&self, record: OutboxRecord) -> Result<OutboxRecord, RepositoryError> {
        // Duplicate intents from concurrent retries of the same attempt land
        // on the primary key and become no-ops; the stored record wins.
        sqlx::query(
            "INSERT INTO outbox_record (
                task_id,
                attempt,
                intent_json,
                payload_hash,
                outcome,
                error,
                recorded_at,
                resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id, attempt) DO NOTHING",
        )
        .bind(&record.task_id.0)
        .bind(i64::from(record.attempt))
        .bind(&record.intent_json)
        .bind(&record.payload_hash)
        .bind(record.outcome.as_str())
        .bind(record.error.as_deref())
        .bind(record.recorded_at.to_rfc3339())
        .bind(record.resolved_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        let key = record.key();
        self.fetch(&key).await?.ok_or_else(|| {
            RepositoryError::Decode(format!(
                "outbox record for task {} attempt {} vanished after insert",
                key.task_id.0, key.attempt
            ))
        })
    }

    async fn resolve(
        &self,
        key: &AttemptKey,
        outcome: OutboxOutcome,
        error: Option<String>,
        resolved_at: DateTime<Utc>,
    ) -> Result<OutboxRecord, RepositoryError> {
        if outcome == OutboxOutcome::Pending {
            return Err(RepositoryError::Conflict(
                "an outbox record cannot be resolved back to pending".to_string(),
            ));
        }

        let updated = sqlx::query(
            "UPDATE outbox_record
             SET outcome = ?, error = ?, resolved_at = ?
             WHERE task_id = ? AND attempt = ? AND outcome = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(error.as_deref())
        .bind(resolved_at.to_rfc3339())
        .bind(&key.task_id.0)
        .bind(i64::from(key.attempt))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let Some(record) = self.fetch(key).await? else {
            return Err(RepositoryError::Conflict(format!(
                "no outbox record exists for task {} attempt {}",
                key.task_id.0, key.attempt
            )));
        };

        if updated == 0 && record.outcome != outcome {
            return Err(RepositoryError::Conflict(format!(
                "outbox record for task {} attempt {} already resolved as {}",
                key.task_id.0,
                key.attempt,
                record.outcome.as_str()
            )));
        }

        Ok(record)
    }

    async fn find(&self, key: &AttemptKey) -> Result<Option<OutboxRecord>, RepositoryError> {
        self.fetch(key).await
    }

    async fn list_pending(&self) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                task_id,
                attempt,
                intent_json,
                payload_hash,
                outcome,
                error,
                recorded_at,
                resolved_at
             FROM outbox_record
             WHERE outcome = 'pending'
             ORDER BY recorded_at ASC, task_id ASC, attempt ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<OutboxRecord, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = OutboxOutcome::parse(&outcome_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown outbox outcome `{outcome_raw}`"))
    })?;

    Ok(OutboxRecord {
        task_id: TaskId(row.try_get("task_id")?),
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        intent_json: row.try_get("intent_json")?,
        payload_hash: row.try_get("payload_hash")?,
        outcome,
        error: row.try_get("error")?,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}
