//! Execution Governor - governed side-effect execution for the agent
//!
//! This crate is the seat of judgment of the factotum system - the layer that
//! decides whether a model-proposed action may run, and then makes sure it
//! runs at most once:
//! - Classifies and gates every action through declarative policy rules
//! - Drives each task through an auditable lifecycle state machine
//! - Persists intent before effect and outcome after (durable outbox)
//! - Retries transient failures with bounded backoff, dead-letters poison tasks
//! - Wraps unreliable upstreams in per-dependency circuit breakers
//!
//! # Architecture
//!
//! The governor follows a strict pipeline per submission:
//! 1. **Policy Gate** (`factotum_core::gate`) - classify risk, allow/deny/escalate
//! 2. **Escalation** (`approval`) - human sign-off for irreversible actions
//! 3. **Outbox pre-write** (`factotum_db`) - persist the intent
//! 4. **Execution** (`executor`, `talents`) - run the action behind the breaker
//! 5. **Outbox post-write + terminal transition** - commit or fail, durably
//!
//! # Key Types
//!
//! - `Governor` - the coordinator (see `governor` module)
//! - `Executor` - pluggable action runner with an idempotency probe
//! - `ApprovalSignal` - external approve/deny source with timeout-deny default
//! - `LlmClient` - model backend, used to describe actions, never perform them
//!
//! # Safety Principle
//!
//! The model proposes; the governor disposes. No side effect runs without a
//! gate verdict, a persisted intent, and a session lock, and a crash between
//! intent and outcome is resolved by probing, never by blind replay.

pub mod approval;
pub mod breaker;
pub mod executor;
pub mod governor;
pub mod llm;
pub mod talents;

pub use approval::{ApprovalDecision, ApprovalSignal, DenyAllApprovals};
pub use breaker::BreakerGuard;
pub use executor::{EffectProbe, ExecutionReport, Executor};
pub use governor::{
    ActionRequest, AmbiguousIntent, Governor, GovernorError, GovernorStores, RecoveryReport,
    TaskReceipt,
};
pub use llm::LlmClient;
pub use talents::{Talent, TalentError, TalentRegistry};
