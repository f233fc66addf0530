use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blast radius of a proposed action, assigned once by the policy gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Read,
    Write,
    Irreversible,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Irreversible => "irreversible",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "irreversible" => Some(Self::Irreversible),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    PolicyChecked,
    Executing,
    Denied,
    Committed,
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::PolicyChecked => "policy_checked",
            Self::Executing => "executing",
            Self::Denied => "denied",
            Self::Committed => "committed",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submitted" => Some(Self::Submitted),
            "policy_checked" => Some(Self::PolicyChecked),
            "executing" => Some(Self::Executing),
            "denied" => Some(Self::Denied),
            "committed" => Some(Self::Committed),
            "failed_retryable" => Some(Self::FailedRetryable),
            "failed_terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }

    /// Terminal states are write-once: a task never leaves one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Committed | Self::FailedTerminal)
    }
}

/// The action a task is asking the governor to perform. Opaque except for
/// `kind`, which the policy gate's classification rules read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub kind: String,
    pub detail_json: String,
}

impl ActionPayload {
    pub fn new(kind: impl Into<String>, detail_json: impl Into<String>) -> Self {
        Self { kind: kind.into(), detail_json: detail_json.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Committed { detail_json: Option<String> },
    Denied { reason: String },
    Failed { error_class: String, error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub trace_id: TraceId,
    pub payload: ActionPayload,
    pub risk_tier: Option<RiskTier>,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub outcome: Option<TaskOutcome>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

/// Audit event recorded for every state change a task goes through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub id: TransitionId,
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub reason: String,
    pub error_class: Option<String>,
    pub context_json: String,
    pub trace_id: TraceId,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{RiskTier, TaskState};

    #[test]
    fn task_state_round_trips_from_storage_encoding() {
        let cases = [
            TaskState::Submitted,
            TaskState::PolicyChecked,
            TaskState::Executing,
            TaskState::Denied,
            TaskState::Committed,
            TaskState::FailedRetryable,
            TaskState::FailedTerminal,
        ];

        for state in cases {
            let decoded = TaskState::parse(state.as_str());
            assert_eq!(decoded, Some(state));
        }
    }

    #[test]
    fn risk_tier_round_trips_from_storage_encoding() {
        for tier in [RiskTier::Read, RiskTier::Write, RiskTier::Irreversible] {
            assert_eq!(RiskTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn terminal_states_are_exactly_denied_committed_failed_terminal() {
        assert!(TaskState::Denied.is_terminal());
        assert!(TaskState::Committed.is_terminal());
        assert!(TaskState::FailedTerminal.is_terminal());
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::PolicyChecked.is_terminal());
        assert!(!TaskState::Executing.is_terminal());
        assert!(!TaskState::FailedRetryable.is_terminal());
    }
}
