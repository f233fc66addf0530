use anyhow::Result;
use async_trait::async_trait;

use factotum_core::domain::task::Task;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved { approver: String },
    Denied { approver: String, reason: String },
}

/// External human-in-the-loop approval source for escalated actions.
///
/// The governor bounds every wait with the configured escalation timeout and
/// treats both timeout and signal errors as denial.
#[async_trait]
pub trait ApprovalSignal: Send + Sync {
    async fn await_decision(&self, task: &Task, description: &str) -> Result<ApprovalDecision>;
}

/// Fail-closed default: every escalation is denied immediately. Useful for
/// headless deployments with no operator channel wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAllApprovals;

#[async_trait]
impl ApprovalSignal for DenyAllApprovals {
    async fn await_decision(&self, _task: &Task, _description: &str) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Denied {
            approver: "system".to_string(),
            reason: "no approval channel configured".to_string(),
        })
    }
}
