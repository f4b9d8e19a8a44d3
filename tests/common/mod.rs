#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use branch_queue::model::tables::{
    archive_table_name, ItemTable, ItemTableKind, HISTORY_TABLE, ID_MAPPINGS_TABLE,
};
use branch_queue::model::{
    BranchError, BranchQueueEntry, ChangeLogRecord, ConnectionSettings, DbValue, DetailValue,
    IdMapping, ItemInfo, LinkInfo, LinkKey, LinkTypeSettings, NewBranchQueueEntry, Row,
};
use branch_queue::services::{DataSelectorResolver, ItemService, NotificationSink};
use branch_queue::store::{
    BranchQueueStore, ConnectionFactory, DatabaseConnection, DatabaseHelper, MergeDatabase,
    MergeSession,
};

pub type SharedEvents = Arc<Mutex<Vec<String>>>;

pub fn events() -> SharedEvents {
    Arc::new(Mutex::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// Merge database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct DbState {
    tables: BTreeMap<String, Vec<Row>>,
    history: Vec<ChangeLogRecord>,
    mappings: Vec<IdMapping>,
}

/// A [`MergeDatabase`] over in-memory tables with transaction snapshots.
pub struct MemoryDatabase {
    name: String,
    events: SharedEvents,
    state: Mutex<DbState>,
    snapshot: Mutex<Option<DbState>>,
    locked: Mutex<bool>,
    locked_tables: Mutex<Vec<String>>,
    unlocked_writes: Mutex<Vec<String>>,
    fail_inserts_into: Mutex<Option<String>>,
    fail_mapping_insert_into: Mutex<Option<String>>,
}

fn link_row_key(row: &Row) -> LinkKey {
    LinkKey {
        source: row.get_u64("item_id").unwrap_or_default(),
        destination: row.get_u64("destination_item_id").unwrap_or_default(),
        link_type: row.get_i64("type").unwrap_or_default(),
    }
}

impl MemoryDatabase {
    pub fn new(name: &str, events: SharedEvents) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events,
            state: Mutex::new(DbState::default()),
            snapshot: Mutex::new(None),
            locked: Mutex::new(false),
            locked_tables: Mutex::new(Vec::new()),
            unlocked_writes: Mutex::new(Vec::new()),
            fail_inserts_into: Mutex::new(None),
            fail_mapping_insert_into: Mutex::new(None),
        })
    }

    fn event(&self, what: &str) {
        self.events.lock().push(format!("{}:{}", self.name, what));
    }

    /// `LOCK TABLES` and `UNLOCK TABLES` commit the open transaction; the
    /// session stays in manual-commit mode, so a new one starts right away.
    fn implicit_commit(&self) {
        let mut snapshot = self.snapshot.lock();
        if snapshot.is_some() {
            *snapshot = Some(self.state.lock().clone());
        }
    }

    fn write(&self, table: &str) {
        if !*self.locked.lock() {
            self.unlocked_writes.lock().push(table.to_string());
        }
    }

    pub fn create_table(&self, table: &str) {
        self.state.lock().tables.entry(table.to_string()).or_default();
    }

    /// Test setup; bypasses locks and failure injection.
    pub fn insert(&self, table: &str, row: Row) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: u64) -> Option<Row> {
        self.rows(table)
            .into_iter()
            .find(|row| row.get_u64("id") == Some(id))
    }

    pub fn push_history(&self, record: ChangeLogRecord) {
        self.state.lock().history.push(record);
    }

    pub fn history_ids(&self) -> Vec<u64> {
        self.state.lock().history.iter().map(|r| r.id).collect()
    }

    pub fn mappings(&self) -> Vec<IdMapping> {
        self.state.lock().mappings.clone()
    }

    pub fn add_mapping(&self, table: &str, our_id: u64, production_id: u64) {
        self.state.lock().mappings.push(IdMapping {
            table_name: table.to_string(),
            our_id,
            production_id,
        });
    }

    pub fn fail_inserts_into(&self, table: &str) {
        *self.fail_inserts_into.lock() = Some(table.to_string());
    }

    /// Fail persisting mappings for `table`, or for every table when empty.
    pub fn fail_mapping_insert_into(&self, table: &str) {
        *self.fail_mapping_insert_into.lock() = Some(table.to_string());
    }

    pub fn fail_mapping_insert(&self) {
        self.fail_mapping_insert_into("");
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Tables passed to the last `lock_tables`.
    pub fn locked_tables(&self) -> Vec<String> {
        self.locked_tables.lock().clone()
    }

    pub fn unlocked_writes(&self) -> Vec<String> {
        self.unlocked_writes.lock().clone()
    }

    /// Move the rows with `column = id` from one table to another.
    pub fn move_rows(&self, from: &str, to: &str, column: &str, id: u64) -> u64 {
        let mut state = self.state.lock();
        let rows = state.tables.entry(from.to_string()).or_default();
        let (moved, kept): (Vec<Row>, Vec<Row>) = rows
            .drain(..)
            .partition(|row| row.get_u64(column) == Some(id));
        *rows = kept;
        let count = moved.len() as u64;
        state.tables.entry(to.to_string()).or_default().extend(moved);
        count
    }

    fn detail_matches(row: &Row, detail: &DetailValue) -> bool {
        row.get_u64(detail.owner_column) == Some(detail.owner_id)
            && row.get_string("key").as_deref() == Some(detail.key.as_str())
            && row.get_string("language_code").unwrap_or_default() == detail.language_code
            && row.get_string("groupname").unwrap_or_default() == detail.group_name
    }
}

#[async_trait::async_trait]
impl MergeDatabase for MemoryDatabase {
    fn database_name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> Result<()> {
        *self.snapshot.lock() = Some(self.state.lock().clone());
        self.event("begin");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        *self.snapshot.lock() = None;
        self.event("commit");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.lock().take() {
            *self.state.lock() = snapshot;
        }
        self.event("rollback");
        Ok(())
    }

    async fn lock_tables(&self, tables: &[String]) -> Result<()> {
        self.implicit_commit();
        *self.locked.lock() = true;
        *self.locked_tables.lock() = tables.to_vec();
        self.event("lock");
        Ok(())
    }

    async fn unlock_tables(&self) -> Result<()> {
        if *self.locked.lock() {
            self.implicit_commit();
        }
        *self.locked.lock() = false;
        self.event("unlock");
        Ok(())
    }

    async fn existing_tables(&self, candidates: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(candidates
            .iter()
            .filter(|t| {
                state.tables.contains_key(t.as_str())
                    || t.as_str() == HISTORY_TABLE
                    || t.as_str() == ID_MAPPINGS_TABLE
            })
            .cloned()
            .collect())
    }

    async fn change_log(&self) -> Result<Vec<ChangeLogRecord>> {
        let mut records = self.state.lock().history.clone();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn delete_change_log(&self, ids: &[u64]) -> Result<u64> {
        self.write(HISTORY_TABLE);
        let mut state = self.state.lock();
        let before = state.history.len();
        state.history.retain(|r| !ids.contains(&r.id));
        Ok((before - state.history.len()) as u64)
    }

    async fn id_mappings(&self) -> Result<Vec<IdMapping>> {
        Ok(self.mappings())
    }

    async fn insert_id_mapping(&self, mapping: &IdMapping) -> Result<()> {
        let failing = self
            .fail_mapping_insert_into
            .lock()
            .as_ref()
            .is_some_and(|table| table.is_empty() || *table == mapping.table_name);
        if failing {
            return Err(anyhow!("Lost connection to MySQL server during query"));
        }
        self.write(ID_MAPPINGS_TABLE);
        self.state.lock().mappings.push(mapping.clone());
        Ok(())
    }

    async fn max_id(&self, table: &str) -> Result<u64> {
        Ok(self
            .rows(table)
            .iter()
            .filter_map(|row| row.get_u64("id"))
            .max()
            .unwrap_or(0))
    }

    async fn find_item(&self, prefix: &str, id: u64) -> Result<Option<ItemInfo>> {
        let live = format!("{}wiser_item", prefix);
        for (table, deleted) in [(live.clone(), false), (archive_table_name(&live), true)] {
            if let Some(row) = self.row(&table, id) {
                return Ok(Some(ItemInfo {
                    id,
                    entity_type: row.get_string("entity_type").unwrap_or_default(),
                    table_prefix: prefix.to_string(),
                    deleted,
                }));
            }
        }
        Ok(None)
    }

    async fn find_link(&self, prefix: &str, id: u64) -> Result<Option<LinkInfo>> {
        let live = format!("{}wiser_itemlink", prefix);
        for table in [live.clone(), archive_table_name(&live)] {
            if let Some(row) = self.row(&table, id) {
                let key = link_row_key(&row);
                return Ok(Some(LinkInfo {
                    id,
                    source: key.source,
                    destination: key.destination,
                    link_type: key.link_type,
                    ordering: row.get_i64("ordering").unwrap_or(1),
                }));
            }
        }
        Ok(None)
    }

    async fn find_link_ids(&self, prefix: &str, key: &LinkKey) -> Result<Vec<u64>> {
        let live = format!("{}wiser_itemlink", prefix);
        let mut ids = Vec::new();
        for table in [live.clone(), archive_table_name(&live)] {
            let mut found: Vec<u64> = self
                .rows(&table)
                .iter()
                .filter(|row| &link_row_key(row) == key)
                .filter_map(|row| row.get_u64("id"))
                .collect();
            found.sort_unstable();
            ids.extend(found);
        }
        Ok(ids)
    }

    async fn dedicated_item_prefixes(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .tables
            .keys()
            .filter_map(|table| ItemTable::parse(table))
            .filter(|t| t.kind == ItemTableKind::Item && !t.archive && !t.prefix.is_empty())
            .map(|t| t.prefix)
            .collect())
    }

    async fn read_row(&self, table: &str, id: u64) -> Result<Option<Row>> {
        Ok(self.row(table, id))
    }

    async fn insert_row(&self, table: &str, row: &Row) -> Result<()> {
        if self.fail_inserts_into.lock().as_deref() == Some(table) {
            return Err(anyhow!("Duplicate entry for key 'PRIMARY' in {}", table));
        }
        self.write(table);
        self.insert(table, row.clone());
        Ok(())
    }

    async fn update_field(&self, table: &str, id: u64, field: &str, value: &DbValue) -> Result<u64> {
        self.write(table);
        let mut state = self.state.lock();
        let mut updated = 0;
        for row in state.tables.entry(table.to_string()).or_default() {
            if row.get_u64("id") == Some(id) {
                row.set(field, value.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_row(&self, table: &str, id: u64) -> Result<u64> {
        self.write(table);
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| row.get_u64("id") != Some(id));
        Ok((before - rows.len()) as u64)
    }

    async fn update_link_field(
        &self,
        prefix: &str,
        key: &LinkKey,
        field: &str,
        value: &DbValue,
    ) -> Result<u64> {
        let table = format!("{}wiser_itemlink", prefix);
        self.write(&table);
        let mut state = self.state.lock();
        let mut updated = 0;
        for row in state.tables.entry(table).or_default() {
            if &link_row_key(row) == key {
                row.set(field, value.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_link(&self, prefix: &str, key: &LinkKey) -> Result<u64> {
        let table = format!("{}wiser_itemlink", prefix);
        self.write(&table);
        let mut state = self.state.lock();
        let rows = state.tables.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| &link_row_key(row) != key);
        Ok((before - rows.len()) as u64)
    }

    async fn upsert_detail(&self, table: &str, detail: &DetailValue) -> Result<()> {
        self.write(table);
        let (value, long_value) = detail.storage_columns();
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|row| Self::detail_matches(row, detail)) {
            Some(row) => {
                row.set("value", value);
                row.set("long_value", long_value);
            }
            None => rows.push(
                Row::new()
                    .with(detail.owner_column, detail.owner_id)
                    .with("language_code", detail.language_code.as_str())
                    .with("groupname", detail.group_name.as_str())
                    .with("key", detail.key.as_str())
                    .with("value", value)
                    .with("long_value", long_value),
            ),
        }
        Ok(())
    }

    async fn delete_detail(&self, table: &str, detail: &DetailValue) -> Result<u64> {
        self.write(table);
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| !Self::detail_matches(row, detail));
        Ok((before - rows.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Item service
// ---------------------------------------------------------------------------

/// Soft deletes move rows between a [`MemoryDatabase`]'s live and archive tables.
pub struct MemoryItemService {
    database: Arc<MemoryDatabase>,
    events: SharedEvents,
    link_types: Vec<LinkTypeSettings>,
    entity_prefixes: HashMap<String, String>,
}

impl MemoryItemService {
    pub fn new(database: Arc<MemoryDatabase>, events: SharedEvents) -> Self {
        Self {
            database,
            events,
            link_types: Vec::new(),
            entity_prefixes: HashMap::new(),
        }
    }

    pub fn with_link_type(mut self, link_type: i64, source: &str, destination: &str) -> Self {
        self.link_types.push(LinkTypeSettings {
            id: self.link_types.len() as u64 + 1,
            link_type,
            name: format!("{} to {}", source, destination),
            destination_entity_type: destination.to_string(),
            source_entity_type: source.to_string(),
            use_dedicated_table: false,
        });
        self
    }

    pub fn with_prefix(mut self, entity_type: &str, prefix: &str) -> Self {
        self.entity_prefixes
            .insert(entity_type.to_string(), prefix.to_string());
        self
    }
}

#[async_trait::async_trait]
impl ItemService for MemoryItemService {
    async fn get_all_link_type_settings(&self) -> Result<Vec<LinkTypeSettings>> {
        Ok(self.link_types.clone())
    }

    async fn get_table_prefix_for_entity(&self, entity_type: &str) -> Result<String> {
        Ok(self
            .entity_prefixes
            .get(entity_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_table_prefix_for_link(&self, _link_type: i64, _source_entity_type: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn delete(&self, item_id: u64, entity_type: &str, undelete: bool) -> Result<()> {
        let locked = if self.database.is_locked() { "locked" } else { "unlocked" };
        self.events.lock().push(format!(
            "items:{} {} ({})",
            if undelete { "undelete" } else { "delete" },
            item_id,
            locked
        ));

        let live = format!("{}wiser_item", self.get_table_prefix_for_entity(entity_type).await?);
        let archive = archive_table_name(&live);
        let (from, to) = if undelete { (archive, live) } else { (live, archive) };
        if self.database.move_rows(&from, &to, "id", item_id) == 0 {
            return Err(BranchError::NotFound { entity: "Item", id: item_id }.into());
        }
        Ok(())
    }

    async fn get_item_details(&self, prefix: &str, item_id: u64) -> Result<Vec<DetailValue>> {
        Ok(self
            .database
            .rows(&format!("{}wiser_itemdetail", prefix))
            .iter()
            .filter(|row| row.get_u64("item_id") == Some(item_id))
            .map(|row| DetailValue {
                owner_column: "item_id",
                owner_id: item_id,
                key: row.get_string("key").unwrap_or_default(),
                language_code: row.get_string("language_code").unwrap_or_default(),
                group_name: row.get_string("groupname").unwrap_or_default(),
                value: row.get_string("value").unwrap_or_default(),
            })
            .collect())
    }
}

pub fn session(database: Arc<MemoryDatabase>, items: MemoryItemService) -> MergeSession {
    MergeSession {
        database,
        items: Arc::new(items),
    }
}

// ---------------------------------------------------------------------------
// Queue store and notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryQueueStore {
    entries: Mutex<Vec<BranchQueueEntry>>,
    pub progress: Mutex<Vec<(u64, u64, u64)>>,
}

impl MemoryQueueStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry(&self, id: u64) -> Option<BranchQueueEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }
}

#[async_trait::async_trait]
impl BranchQueueStore for MemoryQueueStore {
    async fn due_entries(&self) -> Result<Vec<BranchQueueEntry>> {
        let now = Utc::now().naive_utc();
        let mut due: Vec<BranchQueueEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.start_on, e.id));
        Ok(due)
    }

    async fn get_entry(&self, id: u64) -> Result<Option<BranchQueueEntry>> {
        Ok(self.entry(id))
    }

    async fn list_entries(&self, limit: u32) -> Result<Vec<BranchQueueEntry>> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn enqueue(&self, entry: NewBranchQueueEntry) -> Result<u64> {
        let mut entries = self.entries.lock();
        let id = entries.len() as u64 + 1;
        entries.push(BranchQueueEntry {
            id,
            name: entry.name,
            action: entry.action,
            data: entry.data.to_string(),
            start_on: entry.start_on,
            started_on: None,
            finished_on: None,
            success: None,
            errors: Vec::new(),
            items_processed: 0,
            total_items: 0,
            added_by: entry.added_by,
            user_id: entry.user_id,
            added_on: Some(Utc::now().naive_utc()),
        });
        Ok(id)
    }

    async fn mark_started(&self, id: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("No queue row #{}", id))?;
        entry.started_on = Some(Utc::now().naive_utc());
        Ok(())
    }

    async fn update_progress(&self, id: u64, items_processed: u64, total_items: u64) -> Result<()> {
        self.progress.lock().push((id, items_processed, total_items));
        Ok(())
    }

    async fn mark_finished(&self, id: u64, success: bool, errors: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.finished_on = Some(Utc::now().naive_utc());
            entry.success = Some(success);
            entry.errors = errors.to_vec();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<(u64, String, String)>>,
    pub emails: Mutex<Vec<(String, String, String)>>,
}

#[async_trait::async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send_alert(&self, user_id: u64, subject: &str, body: &str) -> Result<()> {
        self.alerts
            .lock()
            .push((user_id, subject.to_string(), body.to_string()));
        Ok(())
    }

    async fn send_email(&self, receiver: &str, subject: &str, body: &str) -> Result<()> {
        self.emails
            .lock()
            .push((receiver.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticDataSelectors {
    pub results: HashMap<u64, Vec<u64>>,
}

#[async_trait::async_trait]
impl DataSelectorResolver for StaticDataSelectors {
    async fn resolve(&self, data_selector_id: u64) -> Result<Vec<u64>> {
        self.results
            .get(&data_selector_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown data selector {}", data_selector_id))
    }
}

// ---------------------------------------------------------------------------
// Server-level fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeHelper {
    pub databases: Mutex<BTreeSet<String>>,
    pub dropped: Mutex<Vec<String>>,
    pub ensured: Mutex<Vec<(String, Vec<String>)>>,
    pub bulk_inserts: Mutex<Vec<(String, String, Vec<Row>)>>,
}

impl FakeHelper {
    pub fn with_databases(names: &[&str]) -> Arc<Self> {
        let helper = Self::default();
        helper
            .databases
            .lock()
            .extend(names.iter().map(|n| n.to_string()));
        Arc::new(helper)
    }

    pub fn inserted_ids(&self, table: &str) -> Vec<u64> {
        self.bulk_inserts
            .lock()
            .iter()
            .filter(|(_, t, _)| t == table)
            .flat_map(|(_, _, rows)| rows.iter().filter_map(|r| r.get_u64("id")))
            .collect()
    }
}

#[async_trait::async_trait]
impl DatabaseHelper for FakeHelper {
    async fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.databases.lock().contains(name))
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.databases.lock().insert(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.databases.lock().remove(name);
        self.dropped.lock().push(name.to_string());
        Ok(())
    }

    async fn ensure_tables_exist(&self, database: &str, tables: &[&str]) -> Result<()> {
        self.ensured.lock().push((
            database.to_string(),
            tables.iter().map(|t| t.to_string()).collect(),
        ));
        Ok(())
    }

    async fn bulk_insert(&self, database: &str, table: &str, rows: &[Row]) -> Result<u64> {
        self.bulk_inserts
            .lock()
            .push((database.to_string(), table.to_string(), rows.to_vec()));
        Ok(rows.len() as u64)
    }
}

type Responder = Arc<dyn Fn(&[DbValue]) -> Vec<Row> + Send + Sync>;

/// Answers queries by the first registered pattern the SQL contains.
pub struct ScriptedConnection {
    name: String,
    server: String,
    responses: Mutex<Vec<(String, Responder)>>,
    failures: Mutex<Vec<String>>,
    affected: Mutex<Vec<(String, u64)>>,
    pub queries: Mutex<Vec<(String, Vec<DbValue>)>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedConnection {
    pub fn new(name: &str, server: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            server: server.to_string(),
            responses: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            affected: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub fn on(&self, pattern: &str, rows: Vec<Row>) {
        self.on_fn(pattern, move |_| rows.clone());
    }

    pub fn on_fn<F>(&self, pattern: &str, responder: F)
    where
        F: Fn(&[DbValue]) -> Vec<Row> + Send + Sync + 'static,
    {
        self.responses
            .lock()
            .push((pattern.to_string(), Arc::new(responder)));
    }

    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().push(pattern.to_string());
    }

    /// Statements containing `pattern` report `rows` affected rows instead of 1.
    pub fn affect(&self, pattern: &str, rows: u64) {
        self.affected.lock().push((pattern.to_string(), rows));
    }

    pub fn executed_matching(&self, pattern: &str) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|sql| sql.contains(pattern))
            .cloned()
            .collect()
    }

    fn check(&self, sql: &str) -> Result<()> {
        match self.failures.lock().iter().find(|p| sql.contains(p.as_str())) {
            Some(pattern) => Err(anyhow!("Scripted failure on '{}'", pattern)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseConnection for ScriptedConnection {
    fn database_name(&self) -> &str {
        &self.name
    }

    fn server_key(&self) -> String {
        self.server.clone()
    }

    async fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>> {
        self.queries.lock().push((sql.to_string(), params.to_vec()));
        self.check(sql)?;
        let responder = self
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, responder)| responder.clone());
        Ok(responder.map(|r| r(params)).unwrap_or_default())
    }

    async fn execute(&self, sql: &str, _params: &[DbValue]) -> Result<u64> {
        self.executed.lock().push(sql.to_string());
        self.check(sql)?;
        Ok(self
            .affected
            .lock()
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(1, |(_, rows)| *rows))
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<u64> {
        self.executed.lock().push(sql.to_string());
        self.check(sql)?;
        Ok(0)
    }
}

/// Hands out scripted connections and merge sessions by database name.
pub struct FakeFactory {
    pub helper: Arc<FakeHelper>,
    connections: HashMap<String, Arc<ScriptedConnection>>,
    sessions: HashMap<String, MergeSession>,
}

impl FakeFactory {
    pub fn new(helper: Arc<FakeHelper>) -> Self {
        Self {
            helper,
            connections: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn with_connection(mut self, connection: Arc<ScriptedConnection>) -> Self {
        self.connections
            .insert(connection.database_name().to_string(), connection);
        self
    }

    pub fn with_session(mut self, name: &str, session: MergeSession) -> Self {
        self.sessions.insert(name.to_string(), session);
        self
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseConnection>> {
        let connection: Arc<dyn DatabaseConnection> = self
            .connections
            .get(&settings.database_name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown database '{}'", settings.database_name))?;
        Ok(connection)
    }

    async fn helper(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseHelper>> {
        let helper: Arc<dyn DatabaseHelper> = self.helper.clone();
        Ok(helper)
    }

    async fn merge_session(&self, settings: &ConnectionSettings) -> Result<MergeSession> {
        self.sessions
            .get(&settings.database_name)
            .cloned()
            .ok_or_else(|| anyhow!("No session for '{}'", settings.database_name))
    }
}

pub fn connection(database_name: &str) -> ConnectionSettings {
    ConnectionSettings {
        database_name: database_name.to_string(),
        ..ConnectionSettings::default()
    }
}
