use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::task::TaskId;

/// Unique key of one execution attempt's durable record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub task_id: TaskId,
    pub attempt: u32,
}

impl AttemptKey {
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        Self { task_id, attempt }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOutcome {
    Pending,
    Committed,
    Failed,
}

impl OutboxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable record of one attempt's intent and outcome.
///
/// The intent is written before the executor runs and is immutable from then
/// on; only `outcome` moves, and only forward (`pending -> committed` or
/// `pending -> failed`). A record still `pending` after a restart marks an
/// attempt whose effect is of unknown status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub task_id: TaskId,
    pub attempt: u32,
    pub intent_json: String,
    pub payload_hash: String,
    pub outcome: OutboxOutcome,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(self.task_id.clone(), self.attempt)
    }
}

/// Sha-256 fingerprint of an intent body, stored alongside it so recovery can
/// detect a payload that changed between attempts.
pub fn hash_intent(intent_json: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(intent_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{hash_intent, OutboxOutcome};

    #[test]
    fn outbox_outcome_round_trips_from_storage_encoding() {
        for outcome in [OutboxOutcome::Pending, OutboxOutcome::Committed, OutboxOutcome::Failed] {
            assert_eq!(OutboxOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }

    #[test]
    fn intent_hash_is_stable_and_input_sensitive() {
        let first = hash_intent("{\"command\":\"ls\"}");
        let second = hash_intent("{\"command\":\"ls\"}");
        let other = hash_intent("{\"command\":\"rm\"}");

        assert_eq!(first, second);
        assert_ne!(first, other);
    }
}
