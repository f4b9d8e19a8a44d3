use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::logic::locks::{compute_lock_set, TableLockGuard};
use crate::logic::replay::{ChangeLogReplayer, ReplayProgress, ReplayReport};
use crate::model::{ChangeLogRecord, IdReconciler, MergeBranchResult, MergeBranchSettings};
use crate::store::MergeSession;

/// Merges one branch into production.
pub struct BranchMerger {
    branch: MergeSession,
    production: MergeSession,
}

impl BranchMerger {
    pub fn new(branch: MergeSession, production: MergeSession) -> Self {
        Self { branch, production }
    }

    /// Replay the branch change log into production.
    ///
    /// Locks are taken on both sides before the first write and released on
    /// every path. The branch transaction (pruned log and new id mappings) is
    /// committed before the production transaction, also at every point where
    /// production is committed early by unlocking it for an item delete.
    pub async fn merge(
        &self,
        settings: &MergeBranchSettings,
        progress: &dyn ReplayProgress,
    ) -> Result<MergeBranchResult> {
        let branch = self.branch.database.clone();
        let production = self.production.database.clone();

        let records = branch.change_log().await?;
        if records.is_empty() {
            info!("Branch '{}' has no changes to merge", branch.database_name());
            return Ok(MergeBranchResult::default());
        }

        let reconciler = IdReconciler::from_mappings(branch.id_mappings().await?)
            .context("The id mappings of the branch are inconsistent")?;
        let item_prefixes = branch
            .dedicated_item_prefixes()
            .await
            .context("Failed to read the dedicated item tables of the branch")?;
        let lock_set = compute_lock_set(&records, reconciler.tables(), &item_prefixes);
        let mut locks = TableLockGuard::prepare(branch.clone(), production.clone(), &lock_set).await?;

        info!(
            "Merging {} change(s) from '{}' into '{}' ({} known id mappings, {}/{} tables to lock)",
            records.len(),
            branch.database_name(),
            production.database_name(),
            reconciler.len(),
            locks.branch_tables().len(),
            locks.production_tables().len()
        );

        let outcome = self
            .run_locked(settings, progress, &mut locks, reconciler, item_prefixes, &records)
            .await;

        if let Err(e) = &outcome {
            error!("Merge of '{}' failed, rolling back: {:#}", branch.database_name(), e);
            if settings.use_transaction {
                if let Err(e) = branch.rollback().await {
                    warn!("Rollback of branch failed: {:#}", e);
                }
                if let Err(e) = production.rollback().await {
                    warn!("Rollback of production failed: {:#}", e);
                }
            }
        }

        if let Err(e) = locks.release().await {
            warn!("Failed to release table locks: {:#}", e);
        }

        let report = outcome?;
        Ok(MergeBranchResult {
            total_changes: report.total,
            successful_changes: report.successful(),
            skipped_by_policy: report.skipped_by_policy,
            errors: report.errors,
            branch_deleted: false,
        })
    }

    async fn run_locked(
        &self,
        settings: &MergeBranchSettings,
        progress: &dyn ReplayProgress,
        locks: &mut TableLockGuard,
        reconciler: IdReconciler,
        item_prefixes: Vec<String>,
        records: &[ChangeLogRecord],
    ) -> Result<ReplayReport> {
        let branch = self.branch.database.clone();
        let production = self.production.database.clone();

        if settings.use_transaction {
            branch.begin().await.context("Failed to start branch transaction")?;
            production
                .begin()
                .await
                .context("Failed to start production transaction")?;
        }
        locks.acquire().await?;

        let report = {
            let mut replayer = ChangeLogReplayer::new(
                branch.clone(),
                production.clone(),
                self.production.items.clone(),
                settings,
                locks,
                reconciler,
            )
            .with_item_prefixes(item_prefixes);
            replayer.replay(records, progress).await?
        };

        branch
            .delete_change_log(report.unpruned())
            .await
            .context("Failed to prune the change log")?;

        if settings.use_transaction {
            branch.commit().await.context("Failed to commit branch")?;
            production.commit().await.context("Failed to commit production")?;
        }

        info!(
            "Merged '{}': {} applied, {} skipped, {} disabled by policy, {} error(s)",
            branch.database_name(),
            report.applied,
            report.skipped,
            report.skipped_by_policy,
            report.errors.len()
        );
        Ok(report)
    }
}
