use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logic::create::BranchCreator;
use crate::logic::delete::BranchDeleter;
use crate::logic::merge::BranchMerger;
use crate::logic::replay::ReplayProgress;
use crate::model::tables::ID_MAPPINGS_TABLE;
use crate::model::{
    BranchAction, BranchError, BranchQueueEntry, BranchQueueItemResult, BranchQueueRunResult,
    BranchQueueSettings, ConnectionSettings, MergeBranchResult,
};
use crate::services::{
    decrypt_connection, render, CredentialDecryptor, DataSelectorResolver, NotificationSink,
    NotificationTemplates, PlainCredentials,
};
use crate::store::{BranchQueueStore, ConnectionFactory};

/// Writes replay progress to the queue row.
struct QueueProgress {
    store: Arc<dyn BranchQueueStore>,
    id: u64,
}

#[async_trait::async_trait]
impl ReplayProgress for QueueProgress {
    async fn report(&self, processed: u64, total: u64) -> Result<()> {
        self.store.update_progress(self.id, processed, total).await
    }
}

/// Runs due branch queue rows one after another.
pub struct BranchQueueOrchestrator {
    store: Arc<dyn BranchQueueStore>,
    factory: Arc<dyn ConnectionFactory>,
    notifier: Arc<dyn NotificationSink>,
    data_selectors: Arc<dyn DataSelectorResolver>,
    decryptor: Arc<dyn CredentialDecryptor>,
    templates: NotificationTemplates,
}

impl BranchQueueOrchestrator {
    pub fn new(
        store: Arc<dyn BranchQueueStore>,
        factory: Arc<dyn ConnectionFactory>,
        notifier: Arc<dyn NotificationSink>,
        data_selectors: Arc<dyn DataSelectorResolver>,
    ) -> Self {
        Self {
            store,
            factory,
            notifier,
            data_selectors,
            decryptor: Arc::new(PlainCredentials),
            templates: NotificationTemplates::default(),
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_templates(mut self, templates: NotificationTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Process every due row. Cancellation is honoured between rows only.
    pub async fn execute(
        &self,
        settings: &BranchQueueSettings,
        cancel: &CancellationToken,
    ) -> Result<BranchQueueRunResult> {
        let mut run = BranchQueueRunResult::new();
        let entries = self
            .store
            .due_entries()
            .await
            .context("Failed to read the branch queue")?;
        if entries.is_empty() {
            return Ok(run);
        }

        let production = decrypt_connection(&settings.production, self.decryptor.as_ref())?;
        info!("Run {}: {} branch queue row(s) due", run.run_id, entries.len());

        for entry in entries {
            if cancel.is_cancelled() {
                info!("Run {} cancelled, leaving remaining rows for the next run", run.run_id);
                break;
            }
            if let Some(result) = self.process(&entry, &production, settings).await {
                run.results.push(result);
            }
        }
        Ok(run)
    }

    /// `None` when the row could not be claimed.
    async fn process(
        &self,
        entry: &BranchQueueEntry,
        production: &ConnectionSettings,
        settings: &BranchQueueSettings,
    ) -> Option<BranchQueueItemResult> {
        if let Err(e) = self.store.mark_started(entry.id).await {
            error!("Could not mark branch queue row #{} as started: {:#}", entry.id, e);
            return None;
        }
        info!("Running {} of '{}' (row #{})", entry.action, entry.name, entry.id);

        let started = Instant::now();
        let outcome = match entry.action {
            BranchAction::Create => self.create(entry, production).await.map(|_| None),
            BranchAction::Merge => self.merge(entry, production).await.map(Some),
            BranchAction::Delete => self.delete(entry, production).await.map(|_| None),
        };
        let duration = started.elapsed();

        let result = match outcome {
            Ok(merge) => BranchQueueItemResult {
                id: entry.id,
                name: entry.name.clone(),
                action: entry.action,
                success: true,
                error_message: None,
                merge,
                duration_ms: duration.as_millis() as u64,
            },
            Err(e) => {
                error!("{} of '{}' failed: {:#}", entry.action, entry.name, e);
                BranchQueueItemResult {
                    id: entry.id,
                    name: entry.name.clone(),
                    action: entry.action,
                    success: false,
                    error_message: Some(format!("{:#}", e)),
                    merge: None,
                    duration_ms: duration.as_millis() as u64,
                }
            }
        };

        let errors = result.errors();
        if let Err(e) = self.store.mark_finished(entry.id, result.success, &errors).await {
            error!("Could not mark branch queue row #{} as finished: {:#}", entry.id, e);
        }
        self.notify(entry, &result, &errors, duration, settings).await;
        Some(result)
    }

    fn branch_connection(
        &self,
        connection: &ConnectionSettings,
        production: &ConnectionSettings,
    ) -> Result<ConnectionSettings> {
        Ok(decrypt_connection(connection, self.decryptor.as_ref())?.inherit_from(production))
    }

    async fn create(&self, entry: &BranchQueueEntry, production: &ConnectionSettings) -> Result<()> {
        let settings = entry.create_settings()?;
        let branch = self.branch_connection(&settings.connection, production)?;
        let created = BranchCreator::new(self.factory.clone(), self.data_selectors.clone())
            .create(production, &branch, &settings)
            .await?;
        info!(
            "Branch '{}' created: {} table(s), {} item(s), {} link(s)",
            created.database_name, created.tables, created.seed.items_copied, created.seed.links_copied
        );
        Ok(())
    }

    async fn merge(
        &self,
        entry: &BranchQueueEntry,
        production: &ConnectionSettings,
    ) -> Result<MergeBranchResult> {
        let settings = entry.merge_settings()?;
        let branch = self.branch_connection(&settings.connection, production)?;
        let name = branch.require_database_name()?.to_string();
        if name.eq_ignore_ascii_case(&production.database_name) {
            return Err(BranchError::Precondition(format!(
                "Cannot merge '{}' into itself",
                name
            ))
            .into());
        }

        let helper = self.factory.helper(&branch).await?;
        if !helper.database_exists(&name).await? {
            return Err(BranchError::Precondition(format!("Branch database '{}' does not exist", name)).into());
        }
        helper.ensure_tables_exist(&name, &[ID_MAPPINGS_TABLE]).await?;

        let branch_session = self.factory.merge_session(&branch).await?;
        let production_session = self.factory.merge_session(production).await?;
        let progress = QueueProgress {
            store: self.store.clone(),
            id: entry.id,
        };

        let mut result = BranchMerger::new(branch_session, production_session)
            .merge(&settings, &progress)
            .await?;

        if settings.delete_branch_after_successful_merge {
            if result.errors.is_empty() {
                match BranchDeleter::new(self.factory.clone())
                    .delete(production, &branch, &name)
                    .await
                {
                    Ok(()) => result.branch_deleted = true,
                    Err(e) => {
                        warn!("Merged '{}' but could not delete it: {:#}", name, e);
                        result.errors.push(format!("Deleting the branch failed: {:#}", e));
                    }
                }
            } else {
                info!("Keeping branch '{}' because the merge reported errors", name);
            }
        }
        Ok(result)
    }

    async fn delete(&self, entry: &BranchQueueEntry, production: &ConnectionSettings) -> Result<()> {
        let settings = entry.delete_settings()?;
        BranchDeleter::new(self.factory.clone())
            .delete(production, production, &settings.database_name)
            .await
    }

    async fn notify(
        &self,
        entry: &BranchQueueEntry,
        result: &BranchQueueItemResult,
        errors: &[String],
        duration: Duration,
        settings: &BranchQueueSettings,
    ) {
        let template = self.templates.for_outcome(entry.action, result.success);
        let (subject, body) = render(template, &entry.name, duration, errors);

        if entry.user_id > 0 {
            if let Err(e) = self.notifier.send_alert(entry.user_id, &subject, &body).await {
                warn!("Could not notify user {}: {:#}", entry.user_id, e);
            }
        }
        if let Some(receiver) = settings.notification_email.as_deref().filter(|r| !r.is_empty()) {
            if let Err(e) = self.notifier.send_email(receiver, &subject, &body).await {
                warn!("Could not e-mail {}: {:#}", receiver, e);
            }
        }
    }
}
