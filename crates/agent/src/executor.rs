use async_trait::async_trait;

use factotum_core::domain::outbox::AttemptKey;
use factotum_core::domain::task::ActionPayload;

/// What one execution attempt reported back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionReport {
    Success { detail_json: Option<String> },
    Retryable { error: String },
    Terminal { error: String },
}

/// Answer to "did this attempt's effect already happen?", used by crash
/// recovery before deciding to re-execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectProbe {
    Committed,
    NotPerformed,
    Unknown,
}

/// The action runner the governor drives. Implementations own the talent
/// dispatch and any third-party clients; the governor only sees the report.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, payload: &ActionPayload) -> ExecutionReport;

    /// Circuit breaker key for the upstream this payload depends on.
    /// `None` marks a purely local action that needs no breaker.
    fn dependency_key(&self, payload: &ActionPayload) -> Option<String> {
        payload.kind.split('.').next().map(str::to_string)
    }

    /// Idempotency check for crash recovery. Actions that cannot answer stay
    /// `Unknown`, which routes the pending intent to operator review instead
    /// of a blind replay.
    async fn probe_effect(&self, key: &AttemptKey, payload: &ActionPayload) -> EffectProbe {
        let _ = (key, payload);
        EffectProbe::Unknown
    }
}
