use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::logic::lifecycle::{LifecycleTracker, ObjectKey};
use crate::logic::locks::TableLockGuard;
use crate::model::tables::{archive_table_name, normalize_table_name, ItemTable, ItemTableKind};
use crate::model::{
    allocate_id, BranchError, ChangeAction, ChangeLogRecord, DbValue, DetailValue, Effect,
    FileOwner, IdMapping, IdReconciler, ItemInfo, LinkInfo, LinkKey, MergeBranchSettings, Row,
    SettingKind,
};
use crate::services::ItemService;
use crate::store::MergeDatabase;

/// Progress is written back to the queue row every this many records.
pub const PROGRESS_INTERVAL: u64 = 100;

/// Receives replay progress, usually the queue row of the merge.
#[async_trait::async_trait]
pub trait ReplayProgress: Send + Sync {
    async fn report(&self, processed: u64, total: u64) -> Result<()>;
}

/// Discards progress.
pub struct NoProgress;

#[async_trait::async_trait]
impl ReplayProgress for NoProgress {
    async fn report(&self, _processed: u64, _total: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The operator rejected this record.
    ConflictRejected,
    /// The object was created and deleted again in the same window.
    TransientObject,
    /// The merge settings do not allow this change.
    PolicyDisabled,
}

impl SkipReason {
    /// Policy skips stay in the log; a later merge with other settings may apply them.
    pub fn prunes(&self) -> bool {
        !matches!(self, SkipReason::PolicyDisabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(String),
}

/// Totals of one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub total: u64,
    pub applied: u64,
    /// Conflict-rejected and transient records.
    pub skipped: u64,
    pub skipped_by_policy: u64,
    /// Change-log ids to delete from the branch.
    pub synchronised: Vec<u64>,
    pub errors: Vec<String>,
    /// Leading entries of `synchronised` already deleted from the branch.
    pruned: usize,
}

impl ReplayReport {
    /// Records that need no further work.
    pub fn successful(&self) -> u64 {
        self.applied + self.skipped
    }

    /// Synchronised ids that are still in the branch change log.
    pub fn unpruned(&self) -> &[u64] {
        &self.synchronised[self.pruned..]
    }

    fn record(&mut self, record: &ChangeLogRecord, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Applied => {
                self.applied += 1;
                self.synchronised.push(record.id);
            }
            RecordOutcome::Skipped(reason) if reason.prunes() => {
                self.skipped += 1;
                self.synchronised.push(record.id);
            }
            RecordOutcome::Skipped(_) => self.skipped_by_policy += 1,
            RecordOutcome::Failed(message) => self.errors.push(message),
        }
    }
}

/// Lookups into the branch that are reused within one merge run.
///
/// Ids are only unique per table, so every entry is keyed by table prefix too.
#[derive(Debug, Default)]
pub struct MergeCaches {
    items: HashMap<(String, u64), ItemInfo>,
    links: HashMap<(String, u64), LinkInfo>,
    files: HashMap<(String, u64), FileOwner>,
}

impl MergeCaches {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Failure of one step. `Fatal` aborts the whole merge, `Record` only the record.
enum StepError {
    Record(anyhow::Error),
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Record(err)
    }
}

impl From<BranchError> for StepError {
    fn from(err: BranchError) -> Self {
        StepError::Record(err.into())
    }
}

type StepResult = Result<RecordOutcome, StepError>;

fn skipped_by_policy() -> StepResult {
    Ok(RecordOutcome::Skipped(SkipReason::PolicyDisabled))
}

fn item_table(prefix: &str) -> String {
    ItemTableKind::Item.table(prefix)
}

fn text_value(value: &Option<String>) -> DbValue {
    DbValue::from(value.clone())
}

/// Replays a branch change log into production.
///
/// Both sessions must be inside a transaction and hold the locks of `locks`.
pub struct ChangeLogReplayer<'a> {
    branch: Arc<dyn MergeDatabase>,
    production: Arc<dyn MergeDatabase>,
    production_items: Arc<dyn ItemService>,
    settings: &'a MergeBranchSettings,
    locks: &'a mut TableLockGuard,
    reconciler: IdReconciler,
    caches: MergeCaches,
    item_prefixes: Vec<String>,
    /// Branch links already bound to an ADD_LINK of this run.
    claimed_links: HashSet<(String, u64)>,
    /// Set when production was committed by unlocking it.
    production_committed: bool,
}

impl<'a> ChangeLogReplayer<'a> {
    pub fn new(
        branch: Arc<dyn MergeDatabase>,
        production: Arc<dyn MergeDatabase>,
        production_items: Arc<dyn ItemService>,
        settings: &'a MergeBranchSettings,
        locks: &'a mut TableLockGuard,
        reconciler: IdReconciler,
    ) -> Self {
        Self {
            branch,
            production,
            production_items,
            settings,
            locks,
            reconciler,
            caches: MergeCaches::new(),
            item_prefixes: vec![String::new()],
            claimed_links: HashSet::new(),
            production_committed: false,
        }
    }

    /// Item table prefixes to search for items that no record's table names,
    /// usually the dedicated prefixes of the branch's entity types.
    pub fn with_item_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        for prefix in prefixes {
            if !self.item_prefixes.contains(&prefix) {
                self.item_prefixes.push(prefix);
            }
        }
        self
    }

    /// Replay `records` in order. Per-record failures are collected in the
    /// report; an `Err` means the merge has to be rolled back.
    pub async fn replay(
        &mut self,
        records: &[ChangeLogRecord],
        progress: &dyn ReplayProgress,
    ) -> Result<ReplayReport> {
        let lifecycle = LifecycleTracker::from_records(records);
        if lifecycle.transient_count() > 0 {
            info!(
                "{} object(s) were created and removed again in the branch, their records are skipped",
                lifecycle.transient_count()
            );
        }
        let prefixes: BTreeSet<String> = records
            .iter()
            .filter_map(|r| ItemTable::parse(&r.table_name))
            .map(|t| t.prefix)
            .filter(|p| !p.is_empty() && !self.item_prefixes.contains(p))
            .collect();
        self.item_prefixes.extend(prefixes);

        let mut report = ReplayReport {
            total: records.len() as u64,
            ..ReplayReport::default()
        };

        for (index, record) in records.iter().enumerate() {
            let outcome = match self.process(record, &lifecycle, &mut report).await {
                Ok(outcome) => outcome,
                Err(StepError::Record(err)) => {
                    let message = format!(
                        "Error while processing {} for {} #{}: {:#}",
                        record.action, record.table_name, record.item_id, err
                    );
                    error!("{}", message);
                    RecordOutcome::Failed(message)
                }
                Err(StepError::Fatal(err)) => {
                    return Err(err.context(format!(
                        "Merge aborted at change-log record #{}",
                        record.id
                    )));
                }
            };
            debug!("Change-log record #{} ({}): {:?}", record.id, record.action, outcome);
            report.record(record, outcome);
            if self.production_committed {
                self.production_committed = false;
                self.checkpoint(&mut report).await?;
            }

            let processed = index as u64 + 1;
            if processed % PROGRESS_INTERVAL == 0 {
                if let Err(e) = progress.report(processed, report.total).await {
                    warn!("Failed to store merge progress: {:#}", e);
                }
            }
        }

        if let Err(e) = progress.report(report.total, report.total).await {
            warn!("Failed to store merge progress: {:#}", e);
        }
        Ok(report)
    }

    async fn process(
        &mut self,
        record: &ChangeLogRecord,
        lifecycle: &LifecycleTracker,
        report: &mut ReplayReport,
    ) -> StepResult {
        if self.settings.conflict_decision(record.id) == Some(false) {
            return Ok(RecordOutcome::Skipped(SkipReason::ConflictRejected));
        }

        let key = ObjectKey::for_record(record)?;
        if lifecycle.is_transient(record, &key) {
            return Ok(RecordOutcome::Skipped(SkipReason::TransientObject));
        }

        match record.action {
            ChangeAction::CreateItem => self.create_item(record).await,
            ChangeAction::UpdateItem => self.update_item(record).await,
            ChangeAction::DeleteItem => self.delete_item(record, false, report).await,
            ChangeAction::UndeleteItem => self.delete_item(record, true, report).await,
            ChangeAction::AddLink => self.add_link(record).await,
            ChangeAction::ChangeLink => self.change_link(record).await,
            ChangeAction::RemoveLink => self.remove_link(record).await,
            ChangeAction::UpdateLinkDetail => self.update_link_detail(record).await,
            ChangeAction::AddFile => self.add_file(record).await,
            ChangeAction::UpdateFile => self.update_file(record).await,
            ChangeAction::DeleteFile => self.delete_file(record).await,
            ChangeAction::Setting { kind, effect } => self.apply_setting(record, kind, effect).await,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups and bookkeeping
    // -----------------------------------------------------------------------

    /// Find a branch item in `{prefix}wiser_item` or its archive.
    async fn branch_item_in(&mut self, prefix: &str, id: u64) -> Result<Option<ItemInfo>> {
        let key = (prefix.to_string(), id);
        if let Some(info) = self.caches.items.get(&key) {
            return Ok(Some(info.clone()));
        }
        let info = self.branch.find_item(prefix, id).await?;
        if let Some(info) = &info {
            self.caches.items.insert(key, info.clone());
        }
        Ok(info)
    }

    /// Find a branch item in any of the item tables this merge knows, for
    /// references (links, files, parents) that do not name their table.
    async fn branch_item(&mut self, id: u64) -> Result<Option<ItemInfo>> {
        for index in 0..self.item_prefixes.len() {
            let prefix = self.item_prefixes[index].clone();
            if let Some(info) = self.branch_item_in(&prefix, id).await? {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    async fn entity_type_of(&mut self, id: u64) -> Result<String> {
        self.branch_item(id)
            .await?
            .map(|info| info.entity_type)
            .ok_or_else(|| BranchError::NotFound { entity: "Item", id }.into())
    }

    async fn entity_type_in(&mut self, prefix: &str, id: u64) -> Result<String> {
        self.branch_item_in(prefix, id)
            .await?
            .map(|info| info.entity_type)
            .ok_or_else(|| BranchError::NotFound { entity: "Item", id }.into())
    }

    /// The production id of a branch item id, using the item table it lives in.
    async fn production_item_id(&mut self, id: u64) -> Result<u64> {
        let prefix = self
            .branch_item(id)
            .await?
            .map(|info| info.table_prefix)
            .unwrap_or_default();
        Ok(self.reconciler.resolve(&item_table(&prefix), id))
    }

    async fn branch_link(&mut self, prefix: &str, id: u64) -> Result<LinkInfo> {
        let key = (prefix.to_string(), id);
        if let Some(link) = self.caches.links.get(&key) {
            return Ok(link.clone());
        }
        let link = self
            .branch
            .find_link(prefix, id)
            .await?
            .ok_or(BranchError::NotFound { entity: "Link", id })?;
        self.caches.links.insert(key, link.clone());
        Ok(link)
    }

    /// Translate branch endpoints into a production link key.
    async fn production_link_key(&mut self, key: LinkKey) -> Result<LinkKey> {
        Ok(LinkKey {
            source: self.production_item_id(key.source).await?,
            destination: self.production_item_id(key.destination).await?,
            link_type: key.link_type,
        })
    }

    /// Pick a production id that is free in both databases.
    async fn allocate(&self, table: &str) -> Result<u64> {
        let live = normalize_table_name(table);
        let archive = archive_table_name(&live);

        let mut production_max = self.production.max_id(&live).await?;
        if self.locks.production_has(&archive) {
            production_max = production_max.max(self.production.max_id(&archive).await?);
        }
        let mut branch_max = self.branch.max_id(&live).await?;
        if self.locks.branch_has(&archive) {
            branch_max = branch_max.max(self.branch.max_id(&archive).await?);
        }
        Ok(allocate_id(production_max, branch_max))
    }

    /// Record and persist a new mapping. Persisting shares the branch
    /// transaction, so a failure there is fatal.
    async fn remember(&mut self, table: &str, our_id: u64, production_id: u64) -> Result<(), StepError> {
        if self.reconciler.record(table, our_id, production_id)? {
            let mapping = IdMapping {
                table_name: normalize_table_name(table),
                our_id,
                production_id,
            };
            self.branch
                .insert_id_mapping(&mapping)
                .await
                .map_err(StepError::Fatal)?;
        }
        Ok(())
    }

    /// Prune the synchronised records from the branch log and commit the
    /// branch, so that its mappings and log match what production committed.
    async fn checkpoint(&mut self, report: &mut ReplayReport) -> Result<()> {
        let pending = report.unpruned();
        if !pending.is_empty() {
            self.branch
                .delete_change_log(pending)
                .await
                .context("Failed to prune the change log")?;
        }
        report.pruned = report.synchronised.len();

        if self.settings.use_transaction {
            self.branch.commit().await.context("Failed to commit branch")?;
            self.branch
                .begin()
                .await
                .context("Failed to start branch transaction")?;
        }
        Ok(())
    }

    async fn delete_in_production(
        &mut self,
        item_id: u64,
        entity_type: &str,
        undelete: bool,
        report: &mut ReplayReport,
    ) -> Result<(), StepError> {
        // Unlocking commits the open production transaction, and locking
        // again commits the delete. The branch has to be durable first.
        self.checkpoint(report).await.map_err(StepError::Fatal)?;
        self.production_committed = true;
        self.locks.release_production().await.map_err(StepError::Fatal)?;
        let result = self
            .production_items
            .delete(item_id, entity_type, undelete)
            .await;
        self.locks.acquire_production().await.map_err(StepError::Fatal)?;
        result.map_err(StepError::Record)
    }

    async fn update_detail(&self, table: &str, detail: DetailValue) -> Result<()> {
        if detail.value.is_empty() {
            self.production.delete_detail(table, &detail).await?;
        } else {
            self.production.upsert_detail(table, &detail).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    fn parse_item_table(record: &ChangeLogRecord) -> Result<ItemTable, BranchError> {
        ItemTable::parse(&record.table_name).ok_or_else(|| BranchError::MalformedRecord {
            id: record.id,
            reason: format!("'{}' is not an item table", record.table_name),
        })
    }

    async fn create_item(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let items = table.item_table();
        let entity_type = self.entity_type_in(&table.prefix, record.item_id).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }
        if self.reconciler.lookup(&items, record.item_id).is_some() {
            return Ok(RecordOutcome::Applied);
        }

        let new_id = self.allocate(&items).await?;
        let row = Row::new()
            .with("id", new_id)
            .with("entity_type", entity_type.as_str())
            .with("added_by", record.changed_by.as_str());
        self.production.insert_row(&items, &row).await?;
        self.remember(&items, record.item_id, new_id).await?;
        debug!("Created {} #{} as #{}", items, record.item_id, new_id);
        Ok(RecordOutcome::Applied)
    }

    async fn update_item(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let entity_type = self.entity_type_in(&table.prefix, record.item_id).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }
        let items = table.item_table();
        let production_id = self.reconciler.resolve(&items, record.item_id);

        if table.kind == ItemTableKind::ItemDetail {
            let detail = DetailValue {
                owner_column: "item_id",
                owner_id: production_id,
                key: record.field.clone(),
                language_code: record.language_code.clone(),
                group_name: record.group_name.clone(),
                value: record.new_value.clone().unwrap_or_default(),
            };
            self.update_detail(&table.name(), detail).await?;
            return Ok(RecordOutcome::Applied);
        }

        let value = if record.field.eq_ignore_ascii_case("parent_item_id") {
            match record.new_value.as_deref().map(str::trim) {
                None | Some("") => DbValue::Null,
                Some(_) => {
                    let parent = record.new_value_id()?;
                    DbValue::from(self.production_item_id(parent).await?)
                }
            }
        } else {
            text_value(&record.new_value)
        };

        let updated = self
            .production
            .update_field(&items, production_id, &record.field, &value)
            .await?;
        let archive = archive_table_name(&items);
        if updated == 0 && self.locks.production_has(&archive) {
            self.production
                .update_field(&archive, production_id, &record.field, &value)
                .await?;
        }
        Ok(RecordOutcome::Applied)
    }

    async fn delete_item(
        &mut self,
        record: &ChangeLogRecord,
        undelete: bool,
        report: &mut ReplayReport,
    ) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let entity_type = match self.branch_item_in(&table.prefix, record.item_id).await? {
            Some(info) => info.entity_type,
            None if !record.field.trim().is_empty() => record.field.trim().to_string(),
            None => {
                return Err(BranchError::NotFound {
                    entity: "Item",
                    id: record.item_id,
                }
                .into())
            }
        };
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        let production_id = self.reconciler.resolve(&table.item_table(), record.item_id);
        self.delete_in_production(production_id, &entity_type, undelete, report)
            .await?;
        Ok(RecordOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    async fn add_link(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let links = table.name();
        let source = record.new_value_id()?;
        let (link_type, ordering) = record.link_type_and_ordering()?;
        let branch_key = LinkKey {
            source,
            destination: record.item_id,
            link_type,
        };

        let entity_type = self.entity_type_of(source).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        // Several branch links can share the endpoints over time. Bind this
        // record to the oldest unmapped one no earlier record has taken; a
        // mapped one means an earlier merge already applied it.
        let candidates: Vec<u64> = self
            .branch
            .find_link_ids(&table.prefix, &branch_key)
            .await?
            .into_iter()
            .filter(|id| !self.claimed_links.contains(&(table.prefix.clone(), *id)))
            .collect();
        let unmapped = candidates
            .iter()
            .copied()
            .find(|id| self.reconciler.lookup(&links, *id).is_none());
        let branch_link_id = match (unmapped, candidates.first()) {
            (Some(id), _) => id,
            (None, Some(&mapped)) => {
                self.claimed_links.insert((table.prefix.clone(), mapped));
                return Ok(RecordOutcome::Applied);
            }
            (None, None) => {
                return Err(anyhow!(
                    "Link {} -> {} (type {}) not found in branch",
                    source,
                    record.item_id,
                    link_type
                )
                .into())
            }
        };
        self.claimed_links.insert((table.prefix.clone(), branch_link_id));

        let key = self.production_link_key(branch_key).await?;
        let new_id = self.allocate(&links).await?;
        let row = Row::new()
            .with("id", new_id)
            .with("item_id", key.source)
            .with("destination_item_id", key.destination)
            .with("type", key.link_type)
            .with("ordering", ordering)
            .with("added_by", record.changed_by.as_str());
        self.production.insert_row(&links, &row).await?;
        self.remember(&links, branch_link_id, new_id).await?;
        Ok(RecordOutcome::Applied)
    }

    async fn change_link(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let link = self.branch_link(&table.prefix, record.item_id).await?;
        let entity_type = self.entity_type_of(link.source).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        // The branch row already holds the new value; the old key uses the old one.
        let mut old_key = link.key();
        let field = record.field.trim().to_ascii_lowercase();
        let new_value = match field.as_str() {
            "item_id" => {
                old_key.source = record.old_value_id()?;
                DbValue::from(self.production_item_id(record.new_value_id()?).await?)
            }
            "destination_item_id" => {
                old_key.destination = record.old_value_id()?;
                DbValue::from(self.production_item_id(record.new_value_id()?).await?)
            }
            "type" => {
                old_key.link_type = record
                    .old_value
                    .as_deref()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| anyhow!("Invalid old link type '{:?}'", record.old_value))?;
                text_value(&record.new_value)
            }
            _ => text_value(&record.new_value),
        };

        let key = self.production_link_key(old_key).await?;
        let updated = self
            .production
            .update_link_field(&table.prefix, &key, &field, &new_value)
            .await?;
        if updated == 0 {
            warn!(
                "CHANGE_LINK #{} matched no link {} -> {} (type {}) in production",
                record.id, key.source, key.destination, key.link_type
            );
        }
        Ok(RecordOutcome::Applied)
    }

    async fn remove_link(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let source = record.old_value_id()?;
        let (link_type, _) = record.link_type_and_ordering()?;
        let entity_type = self.entity_type_of(source).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        let key = self
            .production_link_key(LinkKey {
                source,
                destination: record.item_id,
                link_type,
            })
            .await?;
        let deleted = self.production.delete_link(&table.prefix, &key).await?;
        if deleted == 0 {
            warn!(
                "REMOVE_LINK #{} matched no link {} -> {} (type {}) in production",
                record.id, key.source, key.destination, key.link_type
            );
        }
        Ok(RecordOutcome::Applied)
    }

    async fn update_link_detail(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let link = self.branch_link(&table.prefix, record.item_id).await?;
        let entity_type = self.entity_type_of(link.source).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        let links = ItemTableKind::ItemLink.table(&table.prefix);
        let detail = DetailValue {
            owner_column: "itemlink_id",
            owner_id: self.reconciler.resolve(&links, record.item_id),
            key: record.field.clone(),
            language_code: record.language_code.clone(),
            group_name: record.group_name.clone(),
            value: record.new_value.clone().unwrap_or_default(),
        };
        self.update_detail(&table.name(), detail).await?;
        Ok(RecordOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    async fn branch_file(&self, files: &str, id: u64) -> Result<Option<Row>> {
        if let Some(row) = self.branch.read_row(files, id).await? {
            return Ok(Some(row));
        }
        let archive = archive_table_name(files);
        if self.locks.branch_has(&archive) {
            return self.branch.read_row(&archive, id).await;
        }
        Ok(None)
    }

    async fn file_owner(&mut self, record: &ChangeLogRecord, files: &str, prefix: &str) -> Result<FileOwner> {
        let key = (prefix.to_string(), record.item_id);
        if let Some(owner) = self.caches.files.get(&key) {
            return Ok(*owner);
        }

        let discriminated = match record.action {
            ChangeAction::AddFile | ChangeAction::DeleteFile => record
                .old_value
                .as_deref()
                .zip(record.new_value_id().ok())
                .and_then(|(column, id)| FileOwner::from_discriminator(column, id)),
            _ => None,
        };
        let owner = match discriminated {
            Some(owner) => owner,
            None => {
                let row = self
                    .branch_file(files, record.item_id)
                    .await?
                    .ok_or(BranchError::NotFound { entity: "File", id: record.item_id })?;
                match (row.get_u64("item_id"), row.get_u64("itemlink_id")) {
                    (Some(item), _) if item > 0 => FileOwner::Item(item),
                    (_, Some(link)) if link > 0 => FileOwner::Link(link),
                    _ => return Err(anyhow!("File #{} has no owner", record.item_id)),
                }
            }
        };
        self.caches.files.insert(key, owner);
        Ok(owner)
    }

    async fn file_entity_type(&mut self, owner: FileOwner, prefix: &str) -> Result<String> {
        match owner {
            FileOwner::Item(id) => self.entity_type_of(id).await,
            FileOwner::Link(id) => {
                let link = self.branch_link(prefix, id).await?;
                self.entity_type_of(link.source).await
            }
        }
    }

    async fn add_file(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let files = table.name();
        let owner = self.file_owner(record, &files, &table.prefix).await?;
        let entity_type = self.file_entity_type(owner, &table.prefix).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }
        if self.reconciler.lookup(&files, record.item_id).is_some() {
            return Ok(RecordOutcome::Applied);
        }

        let mut row = self
            .branch_file(&files, record.item_id)
            .await?
            .ok_or(BranchError::NotFound { entity: "File", id: record.item_id })?;
        let new_id = self.allocate(&files).await?;
        row.set("id", new_id);
        match owner {
            FileOwner::Item(id) => row.set("item_id", self.production_item_id(id).await?),
            FileOwner::Link(id) => {
                let links = ItemTableKind::ItemLink.table(&table.prefix);
                row.set("itemlink_id", self.reconciler.resolve(&links, id));
            }
        }
        self.production.insert_row(&files, &row).await?;
        self.remember(&files, record.item_id, new_id).await?;
        Ok(RecordOutcome::Applied)
    }

    async fn update_file(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let files = table.name();
        let owner = self.file_owner(record, &files, &table.prefix).await?;
        let entity_type = self.file_entity_type(owner, &table.prefix).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        let production_id = self.reconciler.resolve(&files, record.item_id);
        if record.field.eq_ignore_ascii_case("content_length") {
            // The log does not carry binary content; copy it from the branch row.
            let row = self
                .branch_file(&files, record.item_id)
                .await?
                .ok_or(BranchError::NotFound { entity: "File", id: record.item_id })?;
            let content = row.get("content").cloned().unwrap_or(DbValue::Null);
            self.production
                .update_field(&files, production_id, "content", &content)
                .await?;
        }
        self.production
            .update_field(&files, production_id, &record.field, &text_value(&record.new_value))
            .await?;
        Ok(RecordOutcome::Applied)
    }

    async fn delete_file(&mut self, record: &ChangeLogRecord) -> StepResult {
        let table = Self::parse_item_table(record)?;
        let files = table.name();
        let owner = self.file_owner(record, &files, &table.prefix).await?;
        let entity_type = self.file_entity_type(owner, &table.prefix).await?;
        if !self.settings.entity_allows(&entity_type, record.action.effect()) {
            return skipped_by_policy();
        }

        let production_id = self.reconciler.resolve(&files, record.item_id);
        let deleted = self.production.delete_row(&files, production_id).await?;
        if deleted == 0 {
            warn!("DELETE_FILE #{}: file #{} not found in production", record.id, production_id);
        }
        Ok(RecordOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    async fn apply_setting(&mut self, record: &ChangeLogRecord, kind: SettingKind, effect: Effect) -> StepResult {
        if !self.settings.setting_allows(kind, effect) {
            return skipped_by_policy();
        }
        let table = kind.table_name();

        match effect {
            Effect::Create => {
                if self.reconciler.lookup(table, record.item_id).is_some() {
                    return Ok(RecordOutcome::Applied);
                }
                let mut row = self
                    .branch
                    .read_row(table, record.item_id)
                    .await?
                    .with_context(|| format!("{} #{} not found in branch", table, record.item_id))?;
                let new_id = self.allocate(table).await?;
                row.set("id", new_id);
                self.production.insert_row(table, &row).await?;
                self.remember(table, record.item_id, new_id).await?;
            }
            Effect::Update => {
                let production_id = self.reconciler.resolve(table, record.item_id);
                self.production
                    .update_field(table, production_id, &record.field, &text_value(&record.new_value))
                    .await?;
            }
            Effect::Delete => {
                let production_id = self.reconciler.resolve(table, record.item_id);
                self.production.delete_row(table, production_id).await?;
            }
        }
        Ok(RecordOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_prunes_everything_but_policy_skips() {
        let record = |id| ChangeLogRecord::new(id, ChangeAction::UpdateItem, "wiser_item", 1);
        let mut report = ReplayReport::default();
        report.record(&record(1), RecordOutcome::Applied);
        report.record(&record(2), RecordOutcome::Skipped(SkipReason::ConflictRejected));
        report.record(&record(3), RecordOutcome::Skipped(SkipReason::TransientObject));
        report.record(&record(4), RecordOutcome::Skipped(SkipReason::PolicyDisabled));
        report.record(&record(5), RecordOutcome::Failed("boom".into()));

        assert_eq!(report.synchronised, vec![1, 2, 3]);
        assert_eq!(report.successful(), 3);
        assert_eq!(report.skipped_by_policy, 1);
        assert_eq!(report.errors, vec!["boom".to_string()]);

        report.pruned = 2;
        assert_eq!(report.unpruned(), &[3]);
    }
}
