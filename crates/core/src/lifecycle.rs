//! Deterministic task lifecycle engine.
//!
//! Provides the state machine that every governed action moves through,
//! ensuring all transitions are auditable, idempotent, and recoverable. The
//! engine is pure: callers supply the clock, and every operation returns the
//! mutated task together with the transition event to persist.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::task::{
    ActionPayload, SessionId, Task, TaskId, TaskOutcome, TaskState, TaskTransition, TraceId,
    TransitionId,
};
use crate::gate::GateDecision;

/// Retry and backoff tunables. All of these come from configuration; the
/// schedule is never hardcoded at call sites.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Maximum execution attempts before a task fails terminally.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub backoff_base_ms: i64,
    /// Multiplier applied per subsequent retry.
    pub backoff_multiplier: u32,
    /// Ceiling on any single backoff delay.
    pub backoff_max_ms: i64,
    /// Uniform jitter fraction added on top of the computed delay (0.0..=1.0).
    pub backoff_jitter: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 5_000,
            backoff_multiplier: 2,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("invalid state transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: TaskState, to: TaskState, reason: String },
    #[error("task {0} has no risk tier assigned; the gate verdict must be applied first")]
    TierNotAssigned(TaskId),
    #[error("risk tier of task {0} is immutable once assigned")]
    TierImmutable(TaskId),
    #[error("task {0} is not yet available for its next attempt")]
    AttemptNotAvailable(TaskId),
    #[error("task {task_id} exhausted its attempt budget ({max_attempts})")]
    AttemptBudgetExhausted { task_id: TaskId, max_attempts: u32 },
}

/// Result of driving a task one step: the updated task and the audit event.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionResult {
    pub task: Task,
    pub transition: TaskTransition,
}

#[derive(Clone, Debug)]
pub struct LifecycleEngine {
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Entry point: a freshly submitted task, not yet policy-checked.
    pub fn create_task(
        &self,
        session_id: SessionId,
        payload: ActionPayload,
        trace_id: TraceId,
        now: DateTime<Utc>,
    ) -> (Task, TaskTransition) {
        let task = Task {
            id: TaskId(Uuid::new_v4().to_string()),
            session_id,
            trace_id,
            payload,
            risk_tier: None,
            state: TaskState::Submitted,
            attempt_count: 0,
            max_attempts: self.config.max_attempts,
            available_at: now,
            outcome: None,
            state_version: 1,
            created_at: now,
            last_transition_at: now,
        };

        let transition = self.transition_event(
            &task,
            None,
            "task_submitted",
            None,
            serde_json::json!({ "kind": task.payload.kind }),
            now,
        );

        (task, transition)
    }

    /// Record the gate's verdict: `Submitted -> PolicyChecked`, assigning the
    /// risk tier. The tier is write-once; a second verdict for the same task
    /// is rejected.
    pub fn apply_verdict(
        &self,
        mut task: Task,
        decision: &GateDecision,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, LifecycleError> {
        self.validate(&task, &TaskState::PolicyChecked)?;
        if task.risk_tier.is_some() {
            return Err(LifecycleError::TierImmutable(task.id.clone()));
        }

        let from = task.state.clone();
        task.risk_tier = Some(decision.tier);
        task.state = TaskState::PolicyChecked;
        self.stamp(&mut task, now);

        let transition = self.transition_event(
            &task,
            Some(from),
            "policy_verdict_recorded",
            None,
            serde_json::json!({
                "risk_tier": decision.tier.as_str(),
                "verdict": decision.verdict.label(),
                "matched_rule": decision.matched_rule,
            }),
            now,
        );

        Ok(TransitionResult { task, transition })
    }

    /// `PolicyChecked -> Denied`, also taken on escalation timeout and on
    /// cancellation of an escalation still awaiting approval.
    pub fn deny(
        &self,
        mut task: Task,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, LifecycleError> {
        self.validate(&task, &TaskState::Denied)?;

        let reason = reason.into();
        let from = task.state.clone();
        task.state = TaskState::Denied;
        task.outcome = Some(TaskOutcome::Denied { reason: reason.clone() });
        self.stamp(&mut task, now);

        let transition = self.transition_event(
            &task,
            Some(from),
            "task_denied",
            Some("policy_denied".to_string()),
            serde_json::json!({ "reason": reason }),
            now,
        );

        Ok(TransitionResult { task, transition })
    }

    /// `PolicyChecked | FailedRetryable -> Executing`, consuming one unit of
    /// the attempt budget. Refuses while backoff still holds the task back.
    pub fn begin_attempt(
        &self,
        mut task: Task,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, LifecycleError> {
        self.validate(&task, &TaskState::Executing)?;
        if task.risk_tier.is_none() {
            return Err(LifecycleError::TierNotAssigned(task.id.clone()));
        }
        if now < task.available_at {
            return Err(LifecycleError::AttemptNotAvailable(task.id.clone()));
        }
        if task.attempt_count >= task.max_attempts {
            return Err(LifecycleError::AttemptBudgetExhausted {
                task_id: task.id.clone(),
                max_attempts: task.max_attempts,
            });
        }

        let from = task.state.clone();
        task.state = TaskState::Executing;
        task.attempt_count += 1;
        self.stamp(&mut task, now);

        let transition = self.transition_event(
            &task,
            Some(from),
            "attempt_started",
            None,
            serde_json::json!({
                "attempt": task.attempt_count,
                "max_attempts": task.max_attempts,
            }),
            now,
        );

        Ok(TransitionResult { task, transition })
    }

    /// `Executing -> Committed`. Callers must have resolved the outbox record
    /// for the current attempt before invoking this.
    pub fn complete(
        &self,
        mut task: Task,
        detail_json: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, LifecycleError> {
        self.validate(&task, &TaskState::Committed)?;

        let from = task.state.clone();
        task.state = TaskState::Committed;
        task.outcome = Some(TaskOutcome::Committed { detail_json });
        self.stamp(&mut task, now);

        let transition = self.transition_event(
            &task,
            Some(from),
            "task_committed",
            None,
            serde_json::json!({ "attempt": task.attempt_count }),
            now,
        );

        Ok(TransitionResult { task, transition })
    }

    /// `Executing -> FailedRetryable | FailedTerminal`.
    ///
    /// A retryable failure with budget remaining schedules the next attempt
    /// with exponential backoff and jitter; otherwise the task is terminal and
    /// belongs in the dead-letter store.
    pub fn fail(
        &self,
        mut task: Task,
        error: impl Into<String>,
        error_class: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, LifecycleError> {
        self.validate(&task, &TaskState::FailedRetryable)?;

        let error = error.into();
        let error_class = error_class.into();
        let from = task.state.clone();
        let budget_left = task.attempt_count < task.max_attempts;

        if retryable && budget_left {
            let delay = self.backoff_delay(task.attempt_count);
            task.state = TaskState::FailedRetryable;
            task.available_at = now + delay;
            self.stamp(&mut task, now);

            let transition = self.transition_event(
                &task,
                Some(from),
                "attempt_failed_retryable",
                Some(error_class.clone()),
                serde_json::json!({
                    "attempt": task.attempt_count,
                    "max_attempts": task.max_attempts,
                    "next_available_at": task.available_at,
                    "error": error,
                }),
                now,
            );

            Ok(TransitionResult { task, transition })
        } else {
            task.state = TaskState::FailedTerminal;
            task.outcome =
                Some(TaskOutcome::Failed { error_class: error_class.clone(), error: error.clone() });
            self.stamp(&mut task, now);

            let transition = self.transition_event(
                &task,
                Some(from),
                "task_failed_terminal",
                Some(error_class),
                serde_json::json!({
                    "attempt": task.attempt_count,
                    "max_attempts": task.max_attempts,
                    "error": error,
                    "retryable": retryable,
                }),
                now,
            );

            Ok(TransitionResult { task, transition })
        }
    }

    /// Delay before the retry that follows `failed_attempt` (1-based).
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let multiplied = self
            .config
            .backoff_base_ms
            .saturating_mul(i64::from(self.config.backoff_multiplier.saturating_pow(exponent)));
        let capped = multiplied.min(self.config.backoff_max_ms);

        let jitter = if self.config.backoff_jitter > 0.0 {
            let fraction = rand::thread_rng().gen_range(0.0..=self.config.backoff_jitter);
            (capped as f64 * fraction) as i64
        } else {
            0
        };

        Duration::milliseconds(capped.saturating_add(jitter))
    }

    fn validate(&self, task: &Task, to: &TaskState) -> Result<(), LifecycleError> {
        let valid = matches!(
            (&task.state, to),
            (TaskState::Submitted, TaskState::PolicyChecked)
                | (TaskState::PolicyChecked, TaskState::Executing)
                | (TaskState::PolicyChecked, TaskState::Denied)
                | (TaskState::FailedRetryable, TaskState::Executing)
                | (TaskState::Executing, TaskState::Committed)
                | (TaskState::Executing, TaskState::FailedRetryable)
                | (TaskState::Executing, TaskState::FailedTerminal)
        );

        if valid {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: task.state.clone(),
                to: to.clone(),
                reason: if task.state.is_terminal() {
                    "task already in terminal state".to_string()
                } else {
                    format!("cannot transition from {:?} to {:?}", task.state, to)
                },
            })
        }
    }

    fn stamp(&self, task: &mut Task, now: DateTime<Utc>) {
        task.state_version += 1;
        task.last_transition_at = now;
    }

    fn transition_event(
        &self,
        task: &Task,
        from: Option<TaskState>,
        reason: &str,
        error_class: Option<String>,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> TaskTransition {
        TaskTransition {
            id: TransitionId(Uuid::new_v4().to_string()),
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            from_state: from,
            to_state: task.state.clone(),
            reason: reason.to_string(),
            error_class,
            context_json: context.to_string(),
            trace_id: task.trace_id.clone(),
            state_version: task.state_version,
            occurred_at: now,
        }
    }
}

impl Default for LifecycleEngine {
    fn default() -> Self {
        Self::new()
    }
}
