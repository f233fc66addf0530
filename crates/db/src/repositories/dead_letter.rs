use sqlx::{sqlite::SqliteRow, Row};

use factotum_core::domain::dead_letter::{AttemptRecord, DeadLetterEntry, DeadLetterReason};
use factotum_core::domain::task::{ActionPayload, SessionId, TaskId, TraceId};

use super::task::parse_timestamp;
use super::{DeadLetterRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDeadLetterRepository {
    pool: DbPool,
}

impl SqlDeadLetterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DeadLetterRepository for SqlDeadLetterRepository {
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError> {
        let attempts_json = serde_json::to_string(&entry.attempts).map_err(|error| {
            RepositoryError::Decode(format!("encode dead-letter attempts: {error}"))
        })?;

        sqlx::query(
            "INSERT INTO dead_letter_entry (
                task_id,
                session_id,
                trace_id,
                payload_kind,
                payload_detail_json,
                reason,
                attempts_json,
                entered_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO NOTHING",
        )
        .bind(&entry.task_id.0)
        .bind(&entry.session_id.0)
        .bind(&entry.trace_id.0)
        .bind(&entry.payload.kind)
        .bind(&entry.payload.detail_json)
        .bind(entry.reason.as_str())
        .bind(&attempts_json)
        .bind(entry.entered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_task(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                task_id,
                session_id,
                trace_id,
                payload_kind,
                payload_detail_json,
                reason,
                attempts_json,
                entered_at
             FROM dead_letter_entry
             WHERE task_id = ?",
        )
        .bind(&task_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(entry_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                task_id,
                session_id,
                trace_id,
                payload_kind,
                payload_detail_json,
                reason,
                attempts_json,
                entered_at
             FROM dead_letter_entry
             ORDER BY entered_at ASC, task_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn purge(&self, task_id: &TaskId) -> Result<bool, RepositoryError> {
        let affected = sqlx::query("DELETE FROM dead_letter_entry WHERE task_id = ?")
            .bind(&task_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected > 0)
    }
}

fn entry_from_row(row: SqliteRow) -> Result<DeadLetterEntry, RepositoryError> {
    let reason_raw = row.try_get::<String, _>("reason")?;
    let reason = DeadLetterReason::parse(&reason_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown dead-letter reason `{reason_raw}`"))
    })?;

    let attempts_raw = row.try_get::<String, _>("attempts_json")?;
    let attempts = serde_json::from_str::<Vec<AttemptRecord>>(&attempts_raw).map_err(|error| {
        RepositoryError::Decode(format!("decode dead-letter attempts: {error}"))
    })?;

    Ok(DeadLetterEntry {
        task_id: TaskId(row.try_get("task_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        trace_id: TraceId(row.try_get("trace_id")?),
        payload: ActionPayload {
            kind: row.try_get("payload_kind")?,
            detail_json: row.try_get("payload_detail_json")?,
        },
        reason,
        attempts,
        entered_at: parse_timestamp("entered_at", row.try_get("entered_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use factotum_core::domain::dead_letter::{AttemptRecord, DeadLetterEntry, DeadLetterReason};
    use factotum_core::domain::task::{ActionPayload, SessionId, TaskId, TraceId};

    use super::SqlDeadLetterRepository;
    use crate::migrations;
    use crate::repositories::DeadLetterRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn dead_letter_round_trip_with_attempt_history() {
        let pool = setup_pool().await;
        let repo = SqlDeadLetterRepository::new(pool.clone());
        let entry = sample_entry("task-dl-001");

        repo.append(entry.clone()).await.expect("append entry");

        let found = repo.find_by_task(&entry.task_id).await.expect("find entry");
        assert_eq!(found, Some(entry.clone()));

        let listed = repo.list().await.expect("list entries");
        assert_eq!(listed, vec![entry]);

        pool.close().await;
    }

    #[tokio::test]
    async fn dead_letter_append_is_write_once_per_task() {
        let pool = setup_pool().await;
        let repo = SqlDeadLetterRepository::new(pool.clone());
        let entry = sample_entry("task-dl-002");

        repo.append(entry.clone()).await.expect("first append");

        let mut second = entry.clone();
        second.reason = DeadLetterReason::TerminalError;
        repo.append(second).await.expect("second append is a no-op");

        let found = repo.find_by_task(&entry.task_id).await.expect("find entry");
        assert_eq!(found.map(|stored| stored.reason), Some(DeadLetterReason::RetriesExhausted));

        pool.close().await;
    }

    #[tokio::test]
    async fn purge_removes_entry_and_reports_outcome() {
        let pool = setup_pool().await;
        let repo = SqlDeadLetterRepository::new(pool.clone());
        let entry = sample_entry("task-dl-003");

        repo.append(entry.clone()).await.expect("append entry");

        assert!(repo.purge(&entry.task_id).await.expect("purge existing"));
        assert!(!repo.purge(&entry.task_id).await.expect("purge missing"));
        assert_eq!(repo.find_by_task(&entry.task_id).await.expect("find entry"), None);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_entry(task_id: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            task_id: TaskId(task_id.to_string()),
            session_id: SessionId("sess-dl".to_string()),
            trace_id: TraceId("trace-dl".to_string()),
            payload: ActionPayload::new("email.send", "{\"to\":\"ops@example.com\"}"),
            reason: DeadLetterReason::RetriesExhausted,
            attempts: vec![
                AttemptRecord {
                    attempt: 1,
                    error_class: "network".to_string(),
                    error: "connection reset".to_string(),
                    occurred_at: parse_ts("2026-03-14T09:01:00Z"),
                },
                AttemptRecord {
                    attempt: 2,
                    error_class: "network".to_string(),
                    error: "connection reset".to_string(),
                    occurred_at: parse_ts("2026-03-14T09:02:00Z"),
                },
            ],
            entered_at: parse_ts("2026-03-14T09:03:00Z"),
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
