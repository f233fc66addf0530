//! Per-dependency circuit breaker state table.
//!
//! Tracks one circuit per upstream dependency key so a degraded model backend
//! or remote talent cannot trigger retry storms, while unrelated dependencies
//! keep flowing. The table is deterministic: callers pass the clock, and the
//! async call-wrapping lives with the governor, not here.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted.
    pub window_secs: i64,
    /// How long an open circuit rejects calls before probing.
    pub cooldown_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, window_secs: 60, cooldown_secs: 120 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Verdict for one prospective call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed { probe: bool },
    RejectedOpen { retry_at: DateTime<Utc> },
}

/// Persistable view of one circuit, so cooldowns survive restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub dependency_key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
struct CircuitEntry {
    state: CircuitStateInner,
    failures: Vec<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum CircuitStateInner {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateInner {
    fn public(self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open => CircuitState::Open,
            Self::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Process-wide breaker table. Shared by handle; every transition happens
/// under the table lock, so readers never observe a torn state.
#[derive(Debug, Default)]
pub struct BreakerTable {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, CircuitEntry>>,
}

impl BreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Decide whether a call against `dependency_key` may proceed.
    ///
    /// An open circuit past its cooldown flips to half-open and admits exactly
    /// one probe; every other caller is rejected until the probe resolves.
    pub fn admit(&self, dependency_key: &str, now: DateTime<Utc>) -> Admission {
        let mut entries = self.lock();
        let entry = entries.entry(dependency_key.to_string()).or_default();

        match entry.state {
            CircuitStateInner::Closed => Admission::Proceed { probe: false },
            CircuitStateInner::Open => {
                let reopen_at = entry
                    .opened_at
                    .map(|opened| opened + Duration::seconds(self.config.cooldown_secs))
                    .unwrap_or(now);
                if now >= reopen_at {
                    entry.state = CircuitStateInner::HalfOpen;
                    entry.probe_in_flight = true;
                    Admission::Proceed { probe: true }
                } else {
                    Admission::RejectedOpen { retry_at: reopen_at }
                }
            }
            CircuitStateInner::HalfOpen => {
                if entry.probe_in_flight {
                    Admission::RejectedOpen { retry_at: now }
                } else {
                    entry.probe_in_flight = true;
                    Admission::Proceed { probe: true }
                }
            }
        }
    }

    /// Record a successful call: closes a half-open circuit and clears the
    /// failure window.
    pub fn record_success(&self, dependency_key: &str, _now: DateTime<Utc>) {
        let mut entries = self.lock();
        let entry = entries.entry(dependency_key.to_string()).or_default();

        entry.state = CircuitStateInner::Closed;
        entry.failures.clear();
        entry.opened_at = None;
        entry.probe_in_flight = false;
    }

    /// Record a failed call. A failed probe reopens immediately and restarts
    /// the cooldown clock; in the closed state the sliding window decides.
    pub fn record_failure(&self, dependency_key: &str, now: DateTime<Utc>) {
        let mut entries = self.lock();
        let entry = entries.entry(dependency_key.to_string()).or_default();

        match entry.state {
            CircuitStateInner::HalfOpen => {
                entry.state = CircuitStateInner::Open;
                entry.opened_at = Some(now);
                entry.failures.clear();
                entry.probe_in_flight = false;
            }
            CircuitStateInner::Closed => {
                let window_start = now - Duration::seconds(self.config.window_secs);
                entry.failures.push(now);
                entry.failures.retain(|failed_at| *failed_at >= window_start);
                if entry.failures.len() as u32 >= self.config.failure_threshold {
                    entry.state = CircuitStateInner::Open;
                    entry.opened_at = Some(now);
                }
            }
            CircuitStateInner::Open => {}
        }
    }

    pub fn state_of(&self, dependency_key: &str) -> CircuitState {
        let entries = self.lock();
        entries
            .get(dependency_key)
            .map(|entry| entry.state.public())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<CircuitSnapshot> {
        let entries = self.lock();
        let mut snapshots: Vec<CircuitSnapshot> = entries
            .iter()
            .map(|(key, entry)| CircuitSnapshot {
                dependency_key: key.clone(),
                state: entry.state.public(),
                failure_count: entry.failures.len() as u32,
                opened_at: entry.opened_at,
                updated_at: now,
            })
            .collect();
        snapshots.sort_by(|left, right| left.dependency_key.cmp(&right.dependency_key));
        snapshots
    }

    /// Restore persisted circuits, typically at startup. A restored half-open
    /// circuit has no probe in flight; the next admit takes the probe slot.
    pub fn restore(&self, snapshots: Vec<CircuitSnapshot>) {
        let mut entries = self.lock();
        for snapshot in snapshots {
            let state = match snapshot.state {
                CircuitState::Closed => CircuitStateInner::Closed,
                CircuitState::Open => CircuitStateInner::Open,
                CircuitState::HalfOpen => CircuitStateInner::HalfOpen,
            };
            entries.insert(
                snapshot.dependency_key,
                CircuitEntry {
                    state,
                    failures: Vec::new(),
                    opened_at: snapshot.opened_at,
                    probe_in_flight: false,
                },
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
