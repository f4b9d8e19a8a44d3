use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::BranchAction;

/// Outcome of replaying a branch's change log into production.
///
/// A merge with errors but some applied changes still counts as a success:
/// failed records stay in the change log and are retried next time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeBranchResult {
    pub total_changes: u64,
    pub successful_changes: u64,
    pub skipped_by_policy: u64,
    pub errors: Vec<String>,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchQueueItemResult {
    pub id: u64,
    pub name: String,
    pub action: BranchAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeBranchResult>,
    pub duration_ms: u64,
}

impl BranchQueueItemResult {
    /// Every error that should end up on the queue row.
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self.error_message.iter().cloned().collect();
        if let Some(merge) = &self.merge {
            errors.extend(merge.errors.iter().cloned());
        }
        errors
    }
}

/// The result document of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchQueueRunResult {
    pub run_id: Uuid,
    pub results: Vec<BranchQueueItemResult>,
}

impl BranchQueueRunResult {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            results: Vec::new(),
        }
    }
}

impl Default for BranchQueueRunResult {
    fn default() -> Self {
        Self::new()
    }
}
