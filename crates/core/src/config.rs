use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::gate::PolicyRules;
use crate::lifecycle::LifecycleConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub governor: GovernorConfig,
    pub breaker: BreakerSettings,
    pub policy: PolicyRules,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

/// Retry, locking, and escalation tunables for the governor. The backoff
/// schedule and attempt budget are configuration, never hardcoded.
#[derive(Clone, Debug)]
pub struct GovernorConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: i64,
    pub backoff_multiplier: u32,
    pub backoff_max_ms: i64,
    pub backoff_jitter: f64,
    pub session_lock_timeout_secs: u64,
    pub escalation_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window_secs: i64,
    pub cooldown_secs: i64,
}

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub signing_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://factotum.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            governor: GovernorConfig {
                max_attempts: 3,
                backoff_base_ms: 5_000,
                backoff_multiplier: 2,
                backoff_max_ms: 300_000,
                backoff_jitter: 0.2,
                session_lock_timeout_secs: 30,
                escalation_timeout_secs: 300,
            },
            breaker: BreakerSettings { failure_threshold: 3, window_secs: 60, cooldown_secs: 120 },
            policy: PolicyRules::default(),
            ledger: LedgerConfig { signing_key: "factotum-dev-ledger-key".to_string().into() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("factotum.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Lifecycle engine view of the governor tunables.
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            max_attempts: self.governor.max_attempts,
            backoff_base_ms: self.governor.backoff_base_ms,
            backoff_multiplier: self.governor.backoff_multiplier,
            backoff_max_ms: self.governor.backoff_max_ms,
            backoff_jitter: self.governor.backoff_jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            window_secs: self.breaker.window_secs,
            cooldown_secs: self.breaker.cooldown_secs,
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(governor) = patch.governor {
            if let Some(max_attempts) = governor.max_attempts {
                self.governor.max_attempts = max_attempts;
            }
            if let Some(backoff_base_ms) = governor.backoff_base_ms {
                self.governor.backoff_base_ms = backoff_base_ms;
            }
            if let Some(backoff_multiplier) = governor.backoff_multiplier {
                self.governor.backoff_multiplier = backoff_multiplier;
            }
            if let Some(backoff_max_ms) = governor.backoff_max_ms {
                self.governor.backoff_max_ms = backoff_max_ms;
            }
            if let Some(backoff_jitter) = governor.backoff_jitter {
                self.governor.backoff_jitter = backoff_jitter;
            }
            if let Some(session_lock_timeout_secs) = governor.session_lock_timeout_secs {
                self.governor.session_lock_timeout_secs = session_lock_timeout_secs;
            }
            if let Some(escalation_timeout_secs) = governor.escalation_timeout_secs {
                self.governor.escalation_timeout_secs = escalation_timeout_secs;
            }
        }

        if let Some(breaker) = patch.breaker {
            if let Some(failure_threshold) = breaker.failure_threshold {
                self.breaker.failure_threshold = failure_threshold;
            }
            if let Some(window_secs) = breaker.window_secs {
                self.breaker.window_secs = window_secs;
            }
            if let Some(cooldown_secs) = breaker.cooldown_secs {
                self.breaker.cooldown_secs = cooldown_secs;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(classification) = policy.classification {
                self.policy.classification = classification;
            }
            if let Some(deny_patterns) = policy.deny_patterns {
                self.policy.deny_patterns = deny_patterns;
            }
            if let Some(allow) = policy.allow {
                self.policy.allow = allow;
            }
        }

        if let Some(ledger) = patch.ledger {
            if let Some(signing_key_value) = ledger.signing_key {
                self.ledger.signing_key = secret_value(signing_key_value);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FACTOTUM_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FACTOTUM_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("FACTOTUM_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FACTOTUM_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FACTOTUM_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FACTOTUM_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("FACTOTUM_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("FACTOTUM_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("FACTOTUM_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("FACTOTUM_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("FACTOTUM_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FACTOTUM_GOVERNOR_MAX_ATTEMPTS") {
            self.governor.max_attempts = parse_u32("FACTOTUM_GOVERNOR_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("FACTOTUM_GOVERNOR_SESSION_LOCK_TIMEOUT_SECS") {
            self.governor.session_lock_timeout_secs =
                parse_u64("FACTOTUM_GOVERNOR_SESSION_LOCK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("FACTOTUM_GOVERNOR_ESCALATION_TIMEOUT_SECS") {
            self.governor.escalation_timeout_secs =
                parse_u64("FACTOTUM_GOVERNOR_ESCALATION_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FACTOTUM_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold =
                parse_u32("FACTOTUM_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("FACTOTUM_BREAKER_WINDOW_SECS") {
            self.breaker.window_secs = parse_i64("FACTOTUM_BREAKER_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("FACTOTUM_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = parse_i64("FACTOTUM_BREAKER_COOLDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("FACTOTUM_LEDGER_SIGNING_KEY") {
            self.ledger.signing_key = secret_value(value);
        }

        let log_level =
            read_env("FACTOTUM_LOGGING_LEVEL").or_else(|| read_env("FACTOTUM_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FACTOTUM_LOGGING_FORMAT").or_else(|| read_env("FACTOTUM_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.governor.max_attempts = max_attempts;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_governor(&self.governor)?;
        validate_breaker(&self.breaker)?;
        validate_ledger(&self.ledger)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("factotum.toml"), PathBuf::from("config/factotum.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_governor(governor: &GovernorConfig) -> Result<(), ConfigError> {
    if governor.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "governor.max_attempts must be greater than zero".to_string(),
        ));
    }

    if governor.backoff_base_ms <= 0 || governor.backoff_max_ms < governor.backoff_base_ms {
        return Err(ConfigError::Validation(
            "governor backoff requires 0 < backoff_base_ms <= backoff_max_ms".to_string(),
        ));
    }

    if governor.backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "governor.backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&governor.backoff_jitter) {
        return Err(ConfigError::Validation(
            "governor.backoff_jitter must be in range 0.0..=1.0".to_string(),
        ));
    }

    if governor.session_lock_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "governor.session_lock_timeout_secs must be greater than zero".to_string(),
        ));
    }

    if governor.escalation_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "governor.escalation_timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_breaker(breaker: &BreakerSettings) -> Result<(), ConfigError> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "breaker.failure_threshold must be greater than zero".to_string(),
        ));
    }

    if breaker.window_secs <= 0 {
        return Err(ConfigError::Validation(
            "breaker.window_secs must be greater than zero".to_string(),
        ));
    }

    if breaker.cooldown_secs <= 0 {
        return Err(ConfigError::Validation(
            "breaker.cooldown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_ledger(ledger: &LedgerConfig) -> Result<(), ConfigError> {
    if ledger.signing_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation("ledger.signing_key must not be empty".to_string()));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    governor: Option<GovernorPatch>,
    breaker: Option<BreakerPatch>,
    policy: Option<PolicyPatch>,
    ledger: Option<LedgerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernorPatch {
    max_attempts: Option<u32>,
    backoff_base_ms: Option<i64>,
    backoff_multiplier: Option<u32>,
    backoff_max_ms: Option<i64>,
    backoff_jitter: Option<f64>,
    session_lock_timeout_secs: Option<u64>,
    escalation_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BreakerPatch {
    failure_threshold: Option<u32>,
    window_secs: Option<i64>,
    cooldown_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    classification: Option<Vec<crate::gate::ClassificationRule>>,
    deny_patterns: Option<Vec<String>>,
    allow: Option<Vec<crate::gate::AllowRule>>,
}

#[derive(Debug, Default, Deserialize)]
struct LedgerPatch {
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::task::RiskTier;

    #[test]
    fn default_config_passes_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.governor.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 3);
    }

    #[test]
    fn load_applies_patch_file_sections() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
[database]
url = "sqlite://governed.db"
max_connections = 2

[governor]
max_attempts = 5
backoff_base_ms = 100
backoff_max_ms = 1000
backoff_jitter = 0.0

[breaker]
failure_threshold = 7

[policy]
deny_patterns = ["rm -rf /"]

[[policy.classification]]
kind_prefix = "shell.run"
tier = "write"

[[policy.allow]]
tier = "write"
prefix = "git "

[logging]
level = "debug"
format = "json"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite://governed.db");
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.governor.max_attempts, 5);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.policy.deny_patterns, vec!["rm -rf /".to_string()]);
        assert_eq!(config.policy.classification[0].tier, RiskTier::Write);
        assert_eq!(config.policy.allow[0].prefix, "git ");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_reported() {
        let error = AppConfig::load(LoadOptions {
            config_path: Some("/nonexistent/factotum.toml".into()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect_err("should fail");

        assert!(matches!(error, ConfigError::MissingConfigFile(_)));
    }

    #[test]
    fn env_interpolation_substitutes_into_patch_values() {
        std::env::set_var("FACTOTUM_TEST_INTERP_DB", "sqlite://interp.db");

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
[database]
url = "${{FACTOTUM_TEST_INTERP_DB}}"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite://interp.db");
        std::env::remove_var("FACTOTUM_TEST_INTERP_DB");
    }

    #[test]
    fn interpolation_of_missing_variable_fails_load() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
[database]
url = "${{FACTOTUM_TEST_DOES_NOT_EXIST}}"
"#
        )
        .expect("write config");

        let error = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect_err("should fail");

        assert!(matches!(error, ConfigError::MissingEnvInterpolation { .. }));
    }

    #[test]
    fn explicit_overrides_win_over_defaults() {
        let config = AppConfig::load(LoadOptions {
            config_path: None,
            require_file: false,
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                max_attempts: Some(9),
                ..ConfigOverrides::default()
            },
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.governor.max_attempts, 9);
    }

    #[test]
    fn validation_rejects_zero_attempt_budget() {
        let mut config = AppConfig::default();
        config.governor.max_attempts = 0;

        let error = config.validate().expect_err("should fail");
        assert!(matches!(error, ConfigError::Validation(_)));
    }

    #[test]
    fn validation_rejects_jitter_outside_unit_interval() {
        let mut config = AppConfig::default();
        config.governor.backoff_jitter = 1.5;

        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_non_sqlite_database_url() {
        let mut config = AppConfig::default();
        config.database.url = "postgres://localhost/factotum".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn lifecycle_view_carries_backoff_parameters() {
        let config = AppConfig::default();
        let lifecycle = config.lifecycle();

        assert_eq!(lifecycle.max_attempts, config.governor.max_attempts);
        assert_eq!(lifecycle.backoff_base_ms, config.governor.backoff_base_ms);
        assert_eq!(lifecycle.backoff_max_ms, config.governor.backoff_max_ms);
    }
}
