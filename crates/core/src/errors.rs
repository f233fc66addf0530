use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::task::{SessionId, TaskId};
use crate::lifecycle::LifecycleError;

/// Failure taxonomy for governed execution. The governor resolves all of
/// these internally; only `RecoveryAmbiguous` and dead-letter entries reach
/// the operator surface.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GovernError {
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("transient execution failure: {0}")]
    TransientExecution(String),
    #[error("terminal execution failure: {0}")]
    TerminalExecution(String),
    #[error("circuit open for dependency `{dependency_key}` until {retry_at}")]
    BreakerOpen { dependency_key: String, retry_at: DateTime<Utc> },
    #[error("outcome of task {task_id} attempt {attempt} is unknown; operator review required")]
    RecoveryAmbiguous { task_id: TaskId, attempt: u32 },
    #[error("could not acquire the session lock for `{0}` within the configured timeout")]
    LockTimeout(SessionId),
    #[error("approval for task {0} timed out")]
    ApprovalTimedOut(TaskId),
}

impl GovernError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::PolicyDenied(_) => "policy_denied",
            Self::TransientExecution(_) => "transient_execution",
            Self::TerminalExecution(_) => "terminal_execution",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::RecoveryAmbiguous { .. } => "recovery_ambiguous",
            Self::LockTimeout(_) => "lock_timeout",
            Self::ApprovalTimedOut(_) => "approval_timed_out",
        }
    }

    /// Whether the failure feeds the retry loop. A rejected breaker call is
    /// retried like any transient error, but must not count against the
    /// breaker's own failure window again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExecution(_) | Self::BreakerOpen { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DomainError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(DomainError::Lifecycle(_))
            | ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
