use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::Serialize;

use factotum_agent::{BreakerGuard, DenyAllApprovals, Governor, GovernorStores, TalentRegistry};
use factotum_core::breaker::BreakerTable;
use factotum_core::config::{AppConfig, LoadOptions};
use factotum_core::domain::task::TaskId;
use factotum_core::gate::PolicyGate;
use factotum_core::ledger::TaskLedger;
use factotum_db::repositories::{
    SqlBreakerStateRepository, SqlDeadLetterRepository, SqlOutboxRepository, SqlTaskRepository,
};
use factotum_db::{connect_with_settings, DbPool};

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct RecoverySummary {
    resolved_committed: usize,
    resolved_failed: usize,
    reexecuted: usize,
    stalled: Vec<String>,
    ambiguous: Vec<AmbiguousSummary>,
    quarantined_sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AmbiguousSummary {
    task_id: String,
    attempt: u32,
    session_id: Option<String>,
}

pub fn run() -> CommandResult {
    with_governor("recover", |governor| async move {
        let report = governor.recover().await.map_err(|error| error.to_string())?;
        let quarantined = governor.quarantined_sessions().await;

        let summary = RecoverySummary {
            resolved_committed: report.resolved_committed.len(),
            resolved_failed: report.resolved_failed.len(),
            reexecuted: report.reexecuted.len(),
            stalled: report.stalled.iter().map(|task_id| task_id.0.clone()).collect(),
            ambiguous: report
                .ambiguous
                .iter()
                .map(|intent| AmbiguousSummary {
                    task_id: intent.task_id.0.clone(),
                    attempt: intent.attempt,
                    session_id: intent.session_id.as_ref().map(|session| session.0.clone()),
                })
                .collect(),
            quarantined_sessions: quarantined.iter().map(|session| session.0.clone()).collect(),
        };

        serde_json::to_string_pretty(&summary).map_err(|error| error.to_string())
    })
}

pub fn resolve(task_id: &str, attempt: u32, committed: bool, failed: bool) -> CommandResult {
    if committed == failed {
        return CommandResult::failure(
            "resolve",
            "bad_arguments",
            "pass exactly one of --committed or --failed",
            2,
        );
    }

    let task_id = TaskId(task_id.to_string());
    with_governor("resolve", move |governor| async move {
        let receipt = governor
            .resolve_ambiguous(&task_id, attempt, committed)
            .await
            .map_err(|error| error.to_string())?;
        Ok(format!(
            "task {} attempt {attempt} resolved; task state is now {}",
            receipt.task_id.0,
            receipt.state.as_str()
        ))
    })
}

fn with_governor<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(Governor) -> Fut,
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

        let governor = build_governor(&config, pool.clone());
        let result = body(governor).await;
        pool.close().await;
        result
    });

    match outcome {
        Ok(message) => CommandResult::success(command, message),
        Err(message) => CommandResult::failure(command, "operation_failed", message, 4),
    }
}

/// Operator-mode governor: no talents registered (so idempotency probes stay
/// conservative) and the fail-closed approval signal.
fn build_governor(config: &AppConfig, pool: DbPool) -> Governor {
    let stores = GovernorStores {
        tasks: Arc::new(SqlTaskRepository::new(pool.clone())),
        outbox: Arc::new(SqlOutboxRepository::new(pool.clone())),
        dead_letters: Arc::new(SqlDeadLetterRepository::new(pool.clone())),
        breaker_state: Arc::new(SqlBreakerStateRepository::new(pool)),
    };

    Governor::new(
        config.governor.clone(),
        PolicyGate::new(config.policy.clone()),
        TaskLedger::new(config.ledger.signing_key.expose_secret()),
        stores,
        Arc::new(TalentRegistry::default()),
        Arc::new(DenyAllApprovals),
        BreakerGuard::new(Arc::new(BreakerTable::new(config.breaker_config()))),
    )
}
