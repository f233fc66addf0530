use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::task::{ActionPayload, SessionId, TaskId, TraceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    TerminalError,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::TerminalError => "terminal_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retries_exhausted" => Some(Self::RetriesExhausted),
            "terminal_error" => Some(Self::TerminalError),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error_class: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// A poison task, removed from the active queue and retained for inspection.
///
/// Entries are written once, never requeued automatically, and removed only by
/// an explicit operator purge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub trace_id: TraceId,
    pub payload: ActionPayload,
    pub reason: DeadLetterReason,
    pub attempts: Vec<AttemptRecord>,
    pub entered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::DeadLetterReason;

    #[test]
    fn dead_letter_reason_round_trips_from_storage_encoding() {
        for reason in [DeadLetterReason::RetriesExhausted, DeadLetterReason::TerminalError] {
            assert_eq!(DeadLetterReason::parse(reason.as_str()), Some(reason));
        }
    }
}
