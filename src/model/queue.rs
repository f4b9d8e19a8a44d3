use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::{
    BranchError, ConnectionSettings, CreateBranchSettings, DeleteBranchSettings,
    MergeBranchSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchAction {
    Create,
    Merge,
    Delete,
}

impl FromStr for BranchAction {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(BranchAction::Create),
            "merge" => Ok(BranchAction::Merge),
            "delete" => Ok(BranchAction::Delete),
            other => Err(BranchError::Configuration(format!(
                "Unknown branch action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BranchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchAction::Create => "create",
            BranchAction::Merge => "merge",
            BranchAction::Delete => "delete",
        })
    }
}

/// A row of `wiser_branch_queue`. Rows are updated in place and never
/// deleted, so the table doubles as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchQueueEntry {
    pub id: u64,
    pub name: String,
    pub action: BranchAction,
    /// Action-specific settings document (JSON).
    pub data: String,
    pub start_on: Option<NaiveDateTime>,
    pub started_on: Option<NaiveDateTime>,
    pub finished_on: Option<NaiveDateTime>,
    pub success: Option<bool>,
    pub errors: Vec<String>,
    pub items_processed: u64,
    pub total_items: u64,
    pub added_by: String,
    pub user_id: u64,
    pub added_on: Option<NaiveDateTime>,
}

impl BranchQueueEntry {
    pub fn create_settings(&self) -> Result<CreateBranchSettings, BranchError> {
        parse_settings(self.id, &self.data)
    }

    pub fn merge_settings(&self) -> Result<MergeBranchSettings, BranchError> {
        parse_settings(self.id, &self.data)
    }

    pub fn delete_settings(&self) -> Result<DeleteBranchSettings, BranchError> {
        parse_settings(self.id, &self.data)
    }

    /// Eligible rows have not started and are due.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.started_on.is_none() && self.start_on.map_or(true, |start| start <= now)
    }
}

fn parse_settings<T: DeserializeOwned>(id: u64, data: &str) -> Result<T, BranchError> {
    serde_json::from_str(data).map_err(|e| {
        BranchError::Configuration(format!("Invalid settings on branch queue entry #{}: {}", id, e))
    })
}

/// Request to add a row to the branch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBranchQueueEntry {
    pub name: String,
    pub action: BranchAction,
    pub data: serde_json::Value,
    #[serde(default)]
    pub start_on: Option<NaiveDateTime>,
    #[serde(default)]
    pub added_by: String,
    #[serde(default)]
    pub user_id: u64,
}

impl NewBranchQueueEntry {
    /// Reject settings documents that would fail once the row is picked up.
    pub fn validate(&self) -> Result<(), BranchError> {
        if self.name.trim().is_empty() {
            return Err(BranchError::Configuration(
                "A branch queue entry needs a name".to_string(),
            ));
        }

        let database_name = match self.action {
            BranchAction::Create => {
                let settings: CreateBranchSettings = self.settings()?;
                for rule in &settings.entities {
                    rule.validate()?;
                }
                settings.connection.database_name
            }
            BranchAction::Merge => {
                let settings: MergeBranchSettings = self.settings()?;
                settings.connection.database_name
            }
            BranchAction::Delete => {
                let settings: DeleteBranchSettings = self.settings()?;
                settings.database_name
            }
        };

        if database_name.trim().is_empty() {
            return Err(BranchError::Configuration(
                "No database name given for the branch".to_string(),
            ));
        }
        Ok(())
    }

    fn settings<T: DeserializeOwned>(&self) -> Result<T, BranchError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BranchError::Configuration(format!("Invalid {} settings: {}", self.action, e)))
    }
}

/// What one orchestrator run needs besides the queue itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchQueueSettings {
    /// The production database. Branch connections inherit what they leave out.
    pub production: ConnectionSettings,
    /// Extra receiver of every outcome e-mail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<String>,
}
