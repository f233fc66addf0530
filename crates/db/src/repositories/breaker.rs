use sqlx::{sqlite::SqliteRow, Row};

use factotum_core::breaker::{CircuitSnapshot, CircuitState};

use super::task::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{BreakerStateRepository, RepositoryError};
use crate::DbPool;

pub struct SqlBreakerStateRepository {
    pool: DbPool,
}

impl SqlBreakerStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BreakerStateRepository for SqlBreakerStateRepository {
    async fn save_all(&self, snapshots: Vec<CircuitSnapshot>) -> Result<(), RepositoryError> {
        for snapshot in snapshots {
            sqlx::query(
                "INSERT INTO breaker_state (
                    dependency_key,
                    state,
                    failure_count,
                    opened_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(dependency_key) DO UPDATE SET
                    state = excluded.state,
                    failure_count = excluded.failure_count,
                    opened_at = excluded.opened_at,
                    updated_at = excluded.updated_at",
            )
            .bind(&snapshot.dependency_key)
            .bind(snapshot.state.as_str())
            .bind(i64::from(snapshot.failure_count))
            .bind(snapshot.opened_at.map(|value| value.to_rfc3339()))
            .bind(snapshot.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CircuitSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                dependency_key,
                state,
                failure_count,
                opened_at,
                updated_at
             FROM breaker_state
             ORDER BY dependency_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(snapshot_from_row).collect()
    }
}

fn snapshot_from_row(row: SqliteRow) -> Result<CircuitSnapshot, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = CircuitState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown circuit state `{state_raw}`")))?;

    Ok(CircuitSnapshot {
        dependency_key: row.try_get("dependency_key")?,
        state,
        failure_count: parse_u32("failure_count", row.try_get("failure_count")?)?,
        opened_at: parse_optional_timestamp("opened_at", row.try_get("opened_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
