use serde::Serialize;

use factotum_core::config::{AppConfig, LoadOptions};
use factotum_core::domain::task::TaskId;
use factotum_db::repositories::{DeadLetterRepository, SqlDeadLetterRepository};
use factotum_db::{connect_with_settings, DbPool};

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct DeadLetterSummary {
    task_id: String,
    session_id: String,
    trace_id: String,
    payload_kind: String,
    reason: String,
    attempts: usize,
    last_error: Option<String>,
    entered_at: String,
}

pub fn list() -> CommandResult {
    with_pool("dead-letters.list", |pool| async move {
        let repo = SqlDeadLetterRepository::new(pool);
        let entries = repo.list().await.map_err(|error| error.to_string())?;

        let summaries: Vec<DeadLetterSummary> = entries
            .iter()
            .map(|entry| DeadLetterSummary {
                task_id: entry.task_id.0.clone(),
                session_id: entry.session_id.0.clone(),
                trace_id: entry.trace_id.0.clone(),
                payload_kind: entry.payload.kind.clone(),
                reason: entry.reason.as_str().to_string(),
                attempts: entry.attempts.len(),
                last_error: entry.attempts.last().map(|attempt| attempt.error.clone()),
                entered_at: entry.entered_at.to_rfc3339(),
            })
            .collect();

        serde_json::to_string_pretty(&summaries).map_err(|error| error.to_string())
    })
}

pub fn purge(task_id: &str) -> CommandResult {
    let task_id = TaskId(task_id.to_string());
    with_pool("dead-letters.purge", |pool| async move {
        let repo = SqlDeadLetterRepository::new(pool);
        let removed = repo.purge(&task_id).await.map_err(|error| error.to_string())?;
        if removed {
            Ok(format!("purged dead-letter entry for task {}", task_id.0))
        } else {
            Err(format!("no dead-letter entry found for task {}", task_id.0))
        }
    })
}

fn with_pool<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(DbPool) -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let outcome = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| error.to_string())?;
        let result = body(pool.clone()).await;
        pool.close().await;
        result
    });

    match outcome {
        Ok(message) => CommandResult::success(command, message),
        Err(message) => CommandResult::failure(command, "operation_failed", message, 4),
    }
}
