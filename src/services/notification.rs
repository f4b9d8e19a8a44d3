use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use std::time::Duration;

use crate::model::BranchAction;

/// Where finished branch actions are reported.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    /// In-application alert for the user that queued the action.
    async fn send_alert(&self, user_id: u64, subject: &str, body: &str) -> Result<()>;
    async fn send_email(&self, receiver: &str, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

impl MessageTemplate {
    fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// Templates per action and outcome. Placeholders: `{name}`, `{duration}`,
/// `{errorCount}` and `{errors}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationTemplates {
    pub created: MessageTemplate,
    pub create_failed: MessageTemplate,
    pub merged: MessageTemplate,
    pub merge_failed: MessageTemplate,
    pub deleted: MessageTemplate,
    pub delete_failed: MessageTemplate,
}

impl Default for NotificationTemplates {
    fn default() -> Self {
        Self {
            created: MessageTemplate::new(
                "Branch '{name}' created",
                "Branch '{name}' was created in {duration}.",
            ),
            create_failed: MessageTemplate::new(
                "Creating branch '{name}' failed",
                "Branch '{name}' could not be created after {duration}.\n{errors}",
            ),
            merged: MessageTemplate::new(
                "Branch '{name}' merged",
                "Branch '{name}' was merged in {duration} with {errorCount} error(s).\n{errors}",
            ),
            merge_failed: MessageTemplate::new(
                "Merging branch '{name}' failed",
                "Branch '{name}' could not be merged after {duration}.\n{errors}",
            ),
            deleted: MessageTemplate::new(
                "Branch '{name}' deleted",
                "Branch '{name}' was deleted in {duration}.",
            ),
            delete_failed: MessageTemplate::new(
                "Deleting branch '{name}' failed",
                "Branch '{name}' could not be deleted after {duration}.\n{errors}",
            ),
        }
    }
}

impl NotificationTemplates {
    pub fn for_outcome(&self, action: BranchAction, success: bool) -> &MessageTemplate {
        match (action, success) {
            (BranchAction::Create, true) => &self.created,
            (BranchAction::Create, false) => &self.create_failed,
            (BranchAction::Merge, true) => &self.merged,
            (BranchAction::Merge, false) => &self.merge_failed,
            (BranchAction::Delete, true) => &self.deleted,
            (BranchAction::Delete, false) => &self.delete_failed,
        }
    }
}

/// `1h 02m 03s`, `2m 05s` or `4s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Fill in a template, returning `(subject, body)`.
pub fn render(
    template: &MessageTemplate,
    name: &str,
    duration: Duration,
    errors: &[String],
) -> (String, String) {
    let fill = |text: &str| {
        text.replace("{name}", name)
            .replace("{duration}", &format_duration(duration))
            .replace("{errorCount}", &errors.len().to_string())
            .replace("{errors}", &errors.join("\n"))
    };
    (fill(&template.subject), fill(&template.body).trim_end().to_string())
}

/// Queues notifications in `wiser_communication_generated`, where the
/// platform's communication service picks them up.
#[derive(Debug, Clone)]
pub struct CommunicationQueueSink {
    pool: MySqlPool,
    sender: String,
}

impl CommunicationQueueSink {
    pub fn new(pool: MySqlPool, sender: impl Into<String>) -> Self {
        Self {
            pool,
            sender: sender.into(),
        }
    }

    async fn queue(&self, kind: &str, receiver: &str, subject: &str, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO wiser_communication_generated \
             (receiver, sender, subject, content, communicationtype, send_date, added_by, added_on) \
             VALUES (?, ?, ?, ?, ?, NOW(), 'branch-queue', NOW())",
        )
        .bind(receiver)
        .bind(&self.sender)
        .bind(subject)
        .bind(body)
        .bind(kind)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to queue {} for {}", kind, receiver))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NotificationSink for CommunicationQueueSink {
    async fn send_alert(&self, user_id: u64, subject: &str, body: &str) -> Result<()> {
        self.queue("alert", &user_id.to_string(), subject, body).await
    }

    async fn send_email(&self, receiver: &str, subject: &str, body: &str) -> Result<()> {
        self.queue("email", receiver, subject, body).await
    }
}

/// Logs instead of sending, for installations without a communication service.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send_alert(&self, user_id: u64, subject: &str, _body: &str) -> Result<()> {
        log::info!("Alert for user {}: {}", user_id, subject);
        Ok(())
    }

    async fn send_email(&self, receiver: &str, subject: &str, _body: &str) -> Result<()> {
        log::info!("Email to {}: {}", receiver, subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let templates = NotificationTemplates::default();
        let errors = vec!["first".to_string(), "second".to_string()];
        let (subject, body) = render(
            templates.for_outcome(BranchAction::Merge, true),
            "spring",
            Duration::from_secs(125),
            &errors,
        );
        assert_eq!(subject, "Branch 'spring' merged");
        assert_eq!(
            body,
            "Branch 'spring' was merged in 2m 05s with 2 error(s).\nfirst\nsecond"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(4)), "4s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_partial_templates_keep_defaults() {
        let templates: NotificationTemplates =
            serde_json::from_str(r#"{"deleted": {"subject": "Gone: {name}", "body": ""}}"#).unwrap();
        assert_eq!(templates.deleted.subject, "Gone: {name}");
        assert_eq!(templates.created, NotificationTemplates::default().created);
    }
}
