use anyhow::Result;
use async_trait::async_trait;

/// Pluggable model backend: `invoke` turns a prompt into text.
///
/// The governor uses this only to describe pending actions (for escalation
/// prompts), never to perform them.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, prompt: &str, model_hint: Option<&str>) -> Result<String>;
}
