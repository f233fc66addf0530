use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use factotum_core::domain::task::ActionPayload;

use crate::executor::{ExecutionReport, Executor};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TalentError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Terminal(String),
}

/// One named capability (shell, email, calendar, ...). Implementations live
/// with the embedder; the registry only routes by action kind.
#[async_trait]
pub trait Talent: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, input: Value) -> Result<Value, TalentError>;
}

#[derive(Default)]
pub struct TalentRegistry {
    talents: HashMap<String, Box<dyn Talent>>,
}

impl TalentRegistry {
    pub fn register<T>(&mut self, talent: T)
    where
        T: Talent + 'static,
    {
        self.talents.insert(talent.name().to_string(), Box::new(talent));
    }

    pub fn len(&self) -> usize {
        self.talents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.talents.is_empty()
    }
}

#[async_trait]
impl Executor for TalentRegistry {
    async fn execute(&self, payload: &ActionPayload) -> ExecutionReport {
        let Some(talent) = self.talents.get(&payload.kind) else {
            return ExecutionReport::Terminal {
                error: format!("no talent registered for action kind `{}`", payload.kind),
            };
        };

        let input = match serde_json::from_str::<Value>(&payload.detail_json) {
            Ok(input) => input,
            Err(error) => {
                return ExecutionReport::Terminal {
                    error: format!("malformed action detail: {error}"),
                };
            }
        };

        match talent.execute(input).await {
            Ok(output) => ExecutionReport::Success { detail_json: Some(output.to_string()) },
            Err(TalentError::Retryable(error)) => ExecutionReport::Retryable { error },
            Err(TalentError::Terminal(error)) => ExecutionReport::Terminal { error },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{Talent, TalentError, TalentRegistry};
    use crate::executor::{ExecutionReport, Executor};
    use factotum_core::domain::task::ActionPayload;

    struct UptimeTalent;

    #[async_trait::async_trait]
    impl Talent for UptimeTalent {
        fn name(&self) -> &'static str {
            "shell.run"
        }

        async fn execute(&self, input: Value) -> Result<Value, TalentError> {
            match input.get("command").and_then(Value::as_str) {
                Some("uptime") => Ok(json!({ "exit_code": 0 })),
                Some(other) => Err(TalentError::Terminal(format!("unsupported command `{other}`"))),
                None => Err(TalentError::Terminal("missing command".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_action_kind() {
        let mut registry = TalentRegistry::default();
        registry.register(UptimeTalent);
        assert_eq!(registry.len(), 1);

        let report = registry
            .execute(&ActionPayload::new("shell.run", "{\"command\":\"uptime\"}"))
            .await;
        assert_eq!(
            report,
            ExecutionReport::Success { detail_json: Some("{\"exit_code\":0}".to_string()) }
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_a_terminal_error() {
        let registry = TalentRegistry::default();
        assert!(registry.is_empty());

        let report = registry.execute(&ActionPayload::new("calendar.create", "{}")).await;
        assert!(matches!(report, ExecutionReport::Terminal { .. }));
    }

    #[tokio::test]
    async fn malformed_detail_is_a_terminal_error() {
        let mut registry = TalentRegistry::default();
        registry.register(UptimeTalent);

        let report = registry.execute(&ActionPayload::new("shell.run", "not json")).await;
        assert!(matches!(report, ExecutionReport::Terminal { .. }));
    }
}
