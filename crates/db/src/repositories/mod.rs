use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use factotum_core::breaker::CircuitSnapshot;
use factotum_core::domain::dead_letter::DeadLetterEntry;
use factotum_core::domain::outbox::{AttemptKey, OutboxOutcome, OutboxRecord};
use factotum_core::domain::task::{SessionId, Task, TaskId, TaskState, TaskTransition};

pub mod breaker;
pub mod dead_letter;
pub mod memory;
pub mod outbox;
pub mod task;

pub use breaker::SqlBreakerStateRepository;
pub use dead_letter::SqlDeadLetterRepository;
pub use memory::{
    InMemoryBreakerStateRepository, InMemoryDeadLetterRepository, InMemoryOutboxRepository,
    InMemoryTaskRepository,
};
pub use outbox::SqlOutboxRepository;
pub use task::SqlTaskRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// Tasks still in flight, for the crash-recovery scan at startup.
    async fn list_non_terminal(&self) -> Result<Vec<Task>, RepositoryError>;

    async fn save(&self, task: Task) -> Result<(), RepositoryError>;

    async fn append_transition(&self, transition: TaskTransition) -> Result<(), RepositoryError>;

    async fn list_transitions(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<TaskTransition>, RepositoryError>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Idempotent insert keyed by `(task_id, attempt)`: a duplicate call
    /// returns the already-stored record unchanged.
    async fn record_intent(&self, record: OutboxRecord) -> Result<OutboxRecord, RepositoryError>;

    /// Move `pending -> committed|failed`. Re-resolving to the same outcome
    /// is a no-op; a conflicting resolution is rejected.
    async fn resolve(
        &self,
        key: &AttemptKey,
        outcome: OutboxOutcome,
        error: Option<String>,
        resolved_at: DateTime<Utc>,
    ) -> Result<OutboxRecord, RepositoryError>;

    async fn find(&self, key: &AttemptKey) -> Result<Option<OutboxRecord>, RepositoryError>;

    async fn list_pending(&self) -> Result<Vec<OutboxRecord>, RepositoryError>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError>;

    async fn find_by_task(&self, task_id: &TaskId)
        -> Result<Option<DeadLetterEntry>, RepositoryError>;

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, RepositoryError>;

    /// Operator purge. Returns whether an entry was removed.
    async fn purge(&self, task_id: &TaskId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait BreakerStateRepository: Send + Sync {
    async fn save_all(&self, snapshots: Vec<CircuitSnapshot>) -> Result<(), RepositoryError>;

    async fn load_all(&self) -> Result<Vec<CircuitSnapshot>, RepositoryError>;
}
