use std::future::Future;
use std::sync::Arc;

use chrono::Utc;

use factotum_core::breaker::{Admission, BreakerTable};
use factotum_core::errors::GovernError;

/// Async guard over the deterministic breaker table.
///
/// `call` short-circuits without polling the operation when the circuit is
/// open; otherwise it runs the operation and feeds the outcome back into the
/// table. Callers decide what counts as an upstream failure by returning
/// `Err` from the operation.
#[derive(Clone)]
pub struct BreakerGuard {
    table: Arc<BreakerTable>,
}

impl BreakerGuard {
    pub fn new(table: Arc<BreakerTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<BreakerTable> {
        &self.table
    }

    pub async fn call<T, F>(&self, dependency_key: &str, operation: F) -> Result<T, GovernError>
    where
        F: Future<Output = Result<T, String>>,
    {
        match self.table.admit(dependency_key, Utc::now()) {
            Admission::RejectedOpen { retry_at } => Err(GovernError::BreakerOpen {
                dependency_key: dependency_key.to_string(),
                retry_at,
            }),
            Admission::Proceed { .. } => match operation.await {
                Ok(value) => {
                    self.table.record_success(dependency_key, Utc::now());
                    Ok(value)
                }
                Err(error) => {
                    self.table.record_failure(dependency_key, Utc::now());
                    Err(GovernError::TransientExecution(error))
                }
            },
        }
    }
}
