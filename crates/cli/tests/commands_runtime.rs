use std::env;
use std::sync::{Mutex, OnceLock};

use factotum_cli::commands::{dead_letters, migrate, recover};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    let workdir = tempfile::tempdir().expect("create temp dir");
    let database_url = file_database_url(&workdir);

    with_env(&[("FACTOTUM_DATABASE_URL", &database_url)], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("FACTOTUM_DATABASE_URL", "postgres://localhost/factotum")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn recover_reports_clean_state_on_fresh_database() {
    let workdir = tempfile::tempdir().expect("create temp dir");
    let database_url = file_database_url(&workdir);

    with_env(&[("FACTOTUM_DATABASE_URL", &database_url)], || {
        let migrated = migrate::run();
        assert_eq!(migrated.exit_code, 0, "expected successful migrate run");

        let result = recover::run();
        assert_eq!(result.exit_code, 0, "expected successful recovery scan");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "recover");
        assert_eq!(payload["status"], "ok");

        let summary: Value = serde_json::from_str(payload["message"].as_str().unwrap_or(""))
            .expect("recovery summary should be valid JSON");
        assert_eq!(summary["resolved_committed"], 0);
        assert_eq!(summary["resolved_failed"], 0);
        assert_eq!(summary["ambiguous"].as_array().map(Vec::len), Some(0));
    });
}

#[test]
fn dead_letters_list_is_empty_on_fresh_database() {
    let workdir = tempfile::tempdir().expect("create temp dir");
    let database_url = file_database_url(&workdir);

    with_env(&[("FACTOTUM_DATABASE_URL", &database_url)], || {
        let migrated = migrate::run();
        assert_eq!(migrated.exit_code, 0, "expected successful migrate run");

        let result = dead_letters::list();
        assert_eq!(result.exit_code, 0, "expected successful dead-letter listing");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "dead-letters.list");
        assert_eq!(payload["status"], "ok");

        let entries: Value = serde_json::from_str(payload["message"].as_str().unwrap_or(""))
            .expect("listing should be valid JSON");
        assert_eq!(entries.as_array().map(Vec::len), Some(0));
    });
}

#[test]
fn purge_of_missing_dead_letter_fails() {
    let workdir = tempfile::tempdir().expect("create temp dir");
    let database_url = file_database_url(&workdir);

    with_env(&[("FACTOTUM_DATABASE_URL", &database_url)], || {
        let migrated = migrate::run();
        assert_eq!(migrated.exit_code, 0, "expected successful migrate run");

        let result = dead_letters::purge("task-does-not-exist");
        assert_eq!(result.exit_code, 4, "expected purge failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "operation_failed");
    });
}

#[test]
fn resolve_requires_exactly_one_outcome_flag() {
    with_env(&[], || {
        let neither = recover::resolve("task-1", 1, false, false);
        assert_eq!(neither.exit_code, 2);

        let both = recover::resolve("task-1", 1, true, true);
        assert_eq!(both.exit_code, 2);

        let payload = parse_payload(&both.output);
        assert_eq!(payload["error_class"], "bad_arguments");
    });
}

fn file_database_url(workdir: &tempfile::TempDir) -> String {
    format!("sqlite://{}/factotum.db?mode=rwc", workdir.path().display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "FACTOTUM_DATABASE_URL",
        "FACTOTUM_DATABASE_MAX_CONNECTIONS",
        "FACTOTUM_DATABASE_TIMEOUT_SECS",
        "FACTOTUM_LLM_PROVIDER",
        "FACTOTUM_LLM_API_KEY",
        "FACTOTUM_LLM_BASE_URL",
        "FACTOTUM_LLM_MODEL",
        "FACTOTUM_LLM_TIMEOUT_SECS",
        "FACTOTUM_GOVERNOR_MAX_ATTEMPTS",
        "FACTOTUM_GOVERNOR_SESSION_LOCK_TIMEOUT_SECS",
        "FACTOTUM_GOVERNOR_ESCALATION_TIMEOUT_SECS",
        "FACTOTUM_BREAKER_FAILURE_THRESHOLD",
        "FACTOTUM_BREAKER_WINDOW_SECS",
        "FACTOTUM_BREAKER_COOLDOWN_SECS",
        "FACTOTUM_LEDGER_SIGNING_KEY",
        "FACTOTUM_LOGGING_LEVEL",
        "FACTOTUM_LOGGING_FORMAT",
        "FACTOTUM_LOG_LEVEL",
        "FACTOTUM_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
