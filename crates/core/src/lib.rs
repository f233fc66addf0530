pub mod audit;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gate;
pub mod ledger;
pub mod lifecycle;

pub use breaker::{Admission, BreakerConfig, BreakerTable, CircuitSnapshot, CircuitState};
pub use domain::dead_letter::{AttemptRecord, DeadLetterEntry, DeadLetterReason};
pub use domain::outbox::{AttemptKey, OutboxOutcome, OutboxRecord};
pub use domain::task::{
    ActionPayload, RiskTier, SessionId, Task, TaskId, TaskOutcome, TaskState, TaskTransition,
    TraceId,
};
pub use errors::{ApplicationError, DomainError, GovernError, InterfaceError};
pub use gate::{GateDecision, PolicyGate, PolicyRules, Verdict};
pub use ledger::{LedgerAction, LedgerEntry, TaskLedger, VerificationResult};
pub use lifecycle::{LifecycleConfig, LifecycleEngine, LifecycleError, TransitionResult};

pub use chrono;
