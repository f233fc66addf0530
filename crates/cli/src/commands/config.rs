use factotum_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line("database.url", &config.database.url));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
    ));
    lines.push(render_line("database.timeout_secs", &config.database.timeout_secs.to_string()));

    lines.push(render_line("llm.provider", &format!("{:?}", config.llm.provider)));
    lines.push(render_line("llm.model", &config.llm.model));
    lines.push(render_line(
        "llm.api_key",
        if config.llm.api_key.is_some() { "***redacted***" } else { "(unset)" },
    ));

    lines.push(render_line("governor.max_attempts", &config.governor.max_attempts.to_string()));
    lines.push(render_line(
        "governor.backoff_base_ms",
        &config.governor.backoff_base_ms.to_string(),
    ));
    lines.push(render_line(
        "governor.backoff_multiplier",
        &config.governor.backoff_multiplier.to_string(),
    ));
    lines.push(render_line("governor.backoff_max_ms", &config.governor.backoff_max_ms.to_string()));
    lines.push(render_line(
        "governor.session_lock_timeout_secs",
        &config.governor.session_lock_timeout_secs.to_string(),
    ));
    lines.push(render_line(
        "governor.escalation_timeout_secs",
        &config.governor.escalation_timeout_secs.to_string(),
    ));

    lines.push(render_line(
        "breaker.failure_threshold",
        &config.breaker.failure_threshold.to_string(),
    ));
    lines.push(render_line("breaker.window_secs", &config.breaker.window_secs.to_string()));
    lines.push(render_line("breaker.cooldown_secs", &config.breaker.cooldown_secs.to_string()));

    lines.push(render_line(
        "policy.classification",
        &format!("{} rules", config.policy.classification.len()),
    ));
    lines.push(render_line(
        "policy.deny_patterns",
        &format!("{} patterns", config.policy.deny_patterns.len()),
    ));
    lines.push(render_line("policy.allow", &format!("{} rules", config.policy.allow.len())));

    lines.push(render_line("ledger.signing_key", "***redacted***"));
    lines.push(render_line("logging.level", &config.logging.level));
    lines.push(render_line("logging.format", &format!("{:?}", config.logging.format)));

    lines.join("\n")
}

fn render_line(key: &str, value: &str) -> String {
    format!("  {key} = {value}")
}
