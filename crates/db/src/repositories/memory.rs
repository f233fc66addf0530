use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use factotum_core::breaker::CircuitSnapshot;
use factotum_core::domain::dead_letter::DeadLetterEntry;
use factotum_core::domain::outbox::{AttemptKey, OutboxOutcome, OutboxRecord};
use factotum_core::domain::task::{SessionId, Task, TaskId, TaskState, TaskTransition};

use super::{
    BreakerStateRepository, DeadLetterRepository, OutboxRepository, RepositoryError, TaskRepository,
};

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<String, Task>>,
    transitions: RwLock<Vec<TaskTransition>>,
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|task| task.session_id == *session_id)
            .filter(|task| state.as_ref().map(|wanted| task.state == *wanted).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matched)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> =
            tasks.values().filter(|task| !task.state.is_terminal()).cloned().collect();
        matched.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matched)
    }

    async fn save(&self, task: Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.0.clone(), task);
        Ok(())
    }

    async fn append_transition(&self, transition: TaskTransition) -> Result<(), RepositoryError> {
        let mut transitions = self.transitions.write().await;
        transitions.push(transition);
        Ok(())
    }

    async fn list_transitions(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<TaskTransition>, RepositoryError> {
        let transitions = self.transitions.read().await;
        Ok(transitions.iter().filter(|event| event.task_id == *task_id).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    records: RwLock<HashMap<(String, u32), OutboxRecord>>,
}

#[async_trait::async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn record_intent(&self, record: OutboxRecord) -> Result<OutboxRecord, RepositoryError> {
        let mut records = self.records.write().await;
        let key = (record.task_id.0.clone(), record.attempt);
        let stored = records.entry(key).or_insert(record);
        Ok(stored.clone())
    }

    async fn resolve(
        &self,
        key: &AttemptKey,
        outcome: OutboxOutcome,
        error: Option<String>,
        resolved_at: DateTime<Utc>,
    ) -> Result<OutboxRecord, RepositoryError> {
        if outcome == OutboxOutcome::Pending {
            return Err(RepositoryError::Conflict(
                "an outbox record cannot be resolved back to pending".to_string(),
            ));
        }

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&(key.task_id.0.clone(), key.attempt)) else {
            return Err(RepositoryError::Conflict(format!(
                "no outbox record exists for task {} attempt {}",
                key.task_id.0, key.attempt
            )));
        };

        match record.outcome {
            OutboxOutcome::Pending => {
                record.outcome = outcome;
                record.error = error;
                record.resolved_at = Some(resolved_at);
                Ok(record.clone())
            }
            existing if existing == outcome => Ok(record.clone()),
            existing => Err(RepositoryError::Conflict(format!(
                "outbox record for task {} attempt {} already resolved as {}",
                key.task_id.0,
                key.attempt,
                existing.as_str()
            ))),
        }
    }

    async fn find(&self, key: &AttemptKey) -> Result<Option<OutboxRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&(key.task_id.0.clone(), key.attempt)).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut pending: Vec<OutboxRecord> = records
            .values()
            .filter(|record| record.outcome == OutboxOutcome::Pending)
            .cloned()
            .collect();
        pending.sort_by(|left, right| {
            left.recorded_at
                .cmp(&right.recorded_at)
                .then_with(|| left.task_id.0.cmp(&right.task_id.0))
                .then_with(|| left.attempt.cmp(&right.attempt))
        });
        Ok(pending)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    entries: RwLock<HashMap<String, DeadLetterEntry>>,
}

#[async_trait::async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.entry(entry.task_id.0.clone()).or_insert(entry);
        Ok(())
    }

    async fn find_by_task(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&task_id.0).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut listed: Vec<DeadLetterEntry> = entries.values().cloned().collect();
        listed.sort_by(|left, right| {
            left.entered_at.cmp(&right.entered_at).then_with(|| left.task_id.0.cmp(&right.task_id.0))
        });
        Ok(listed)
    }

    async fn purge(&self, task_id: &TaskId) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(&task_id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryBreakerStateRepository {
    snapshots: RwLock<HashMap<String, CircuitSnapshot>>,
}

#[async_trait::async_trait]
impl BreakerStateRepository for InMemoryBreakerStateRepository {
    async fn save_all(&self, snapshots: Vec<CircuitSnapshot>) -> Result<(), RepositoryError> {
        let mut stored = self.snapshots.write().await;
        for snapshot in snapshots {
            stored.insert(snapshot.dependency_key.clone(), snapshot);
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CircuitSnapshot>, RepositoryError> {
        let stored = self.snapshots.read().await;
        let mut snapshots: Vec<CircuitSnapshot> = stored.values().cloned().collect();
        snapshots.sort_by(|left, right| left.dependency_key.cmp(&right.dependency_key));
        Ok(snapshots)
    }
}
