use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use factotum_core::domain::task::{
    ActionPayload, RiskTier, SessionId, Task, TaskId, TaskOutcome, TaskState, TaskTransition,
    TraceId, TransitionId,
};

use super::{RepositoryError, TaskRepository};
use crate::DbPool;

pub struct SqlTaskRepository {
    pool: DbPool,
}

impl SqlTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const TASK_COLUMNS: &str = "id,
                session_id,
                trace_id,
                payload_kind,
                payload_detail_json,
                risk_tier,
                state,
                attempt_count,
                max_attempts,
                available_at,
                outcome_json,
                state_version,
                created_at,
                last_transition_at";

#[async_trait::async_trait]
impl TaskRepository for SqlTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS}
             FROM task
             WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(task_from_row).transpose()
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let rows = if let Some(state) = state {
            sqlx::query(&format!(
                "SELECT {TASK_COLUMNS}
                 FROM task
                 WHERE session_id = ? AND state = ?
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(&session_id.0)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {TASK_COLUMNS}
                 FROM task
                 WHERE session_id = ?
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(&session_id.0)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(task_from_row).collect()
    }

    async fn list_non_terminal(&self) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS}
             FROM task
             WHERE state NOT IN ('denied', 'committed', 'failed_terminal')
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    async fn save(&self, task: Task) -> Result<(), RepositoryError> {
        let outcome_json = task
            .outcome
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(format!("encode task outcome: {error}")))?;

        sqlx::query(
            "INSERT INTO task (
                id,
                session_id,
                trace_id,
                payload_kind,
                payload_detail_json,
                risk_tier,
                state,
                attempt_count,
                max_attempts,
                available_at,
                outcome_json,
                state_version,
                created_at,
                last_transition_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                trace_id = excluded.trace_id,
                payload_kind = excluded.payload_kind,
                payload_detail_json = excluded.payload_detail_json,
                risk_tier = excluded.risk_tier,
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                max_attempts = excluded.max_attempts,
                available_at = excluded.available_at,
                outcome_json = excluded.outcome_json,
                state_version = excluded.state_version,
                last_transition_at = excluded.last_transition_at",
        )
        .bind(&task.id.0)
        .bind(&task.session_id.0)
        .bind(&task.trace_id.0)
        .bind(&task.payload.kind)
        .bind(&task.payload.detail_json)
        .bind(task.risk_tier.map(|tier| tier.as_str()))
        .bind(task.state.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(task.available_at.to_rfc3339())
        .bind(outcome_json.as_deref())
        .bind(i64::from(task.state_version))
        .bind(task.created_at.to_rfc3339())
        .bind(task.last_transition_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_transition(&self, transition: TaskTransition) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO task_transition_audit (
                id,
                task_id,
                session_id,
                from_state,
                to_state,
                reason,
                error_class,
                context_json,
                trace_id,
                state_version,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.id.0)
        .bind(&transition.task_id.0)
        .bind(&transition.session_id.0)
        .bind(transition.from_state.as_ref().map(TaskState::as_str))
        .bind(transition.to_state.as_str())
        .bind(&transition.reason)
        .bind(transition.error_class.as_deref())
        .bind(&transition.context_json)
        .bind(&transition.trace_id.0)
        .bind(i64::from(transition.state_version))
        .bind(transition.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<TaskTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                task_id,
                session_id,
                from_state,
                to_state,
                reason,
                error_class,
                context_json,
                trace_id,
                state_version,
                occurred_at
             FROM task_transition_audit
             WHERE task_id = ?
             ORDER BY state_version ASC, occurred_at ASC",
        )
        .bind(&task_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

fn task_from_row(row: SqliteRow) -> Result<Task, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = TaskState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown task state `{state_raw}`")))?;

    let risk_tier = row
        .try_get::<Option<String>, _>("risk_tier")?
        .map(|value| {
            RiskTier::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown risk tier `{value}`")))
        })
        .transpose()?;

    let outcome = row
        .try_get::<Option<String>, _>("outcome_json")?
        .map(|value| {
            serde_json::from_str::<TaskOutcome>(&value)
                .map_err(|error| RepositoryError::Decode(format!("decode task outcome: {error}")))
        })
        .transpose()?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        trace_id: TraceId(row.try_get("trace_id")?),
        payload: ActionPayload {
            kind: row.try_get("payload_kind")?,
            detail_json: row.try_get("payload_detail_json")?,
        },
        risk_tier,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        outcome,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_transition_at: parse_timestamp(
            "last_transition_at",
            row.try_get("last_transition_at")?,
        )?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<TaskTransition, RepositoryError> {
    let from_state = row
        .try_get::<Option<String>, _>("from_state")?
        .map(|value| {
            TaskState::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown from_state `{value}`")))
        })
        .transpose()?;

    let to_state_raw = row.try_get::<String, _>("to_state")?;
    let to_state = TaskState::parse(&to_state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown to_state `{to_state_raw}`")))?;

    Ok(TaskTransition {
        id: TransitionId(row.try_get("id")?),
        task_id: TaskId(row.try_get("task_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        from_state,
        to_state,
        reason: row.try_get("reason")?,
        error_class: row.try_get("error_class")?,
        context_json: row.try_get("context_json")?,
        trace_id: TraceId(row.try_get("trace_id")?),
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
