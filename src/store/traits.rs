use anyhow::Result;
use std::sync::Arc;

use crate::model::{
    BranchQueueEntry, ChangeLogRecord, ConnectionSettings, DbValue, DetailValue, IdMapping,
    ItemInfo, LinkInfo, LinkKey, NewBranchQueueEntry, Row,
};
use crate::services::{ItemService, SqlItemService};

/// A single MySQL session.
///
/// Table locks and transactions belong to a session, so implementations must
/// run every statement on the same underlying connection.
#[async_trait::async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// The schema this session is connected to.
    fn database_name(&self) -> &str;
    /// `host:port` of the server, see [`ConnectionSettings::server_key`].
    fn server_key(&self) -> String;
    async fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>>;
    async fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64>;
    /// Run a statement outside the prepared-statement protocol (DDL with
    /// bodies, `LOCK TABLES`, transaction control).
    async fn execute_unprepared(&self, sql: &str) -> Result<u64>;
}

/// Server-level operations used when creating and removing branches.
#[async_trait::async_trait]
pub trait DatabaseHelper: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool>;
    async fn create_database(&self, name: &str) -> Result<()>;
    /// Idempotent: a missing database is not an error.
    async fn drop_database(&self, name: &str) -> Result<()>;
    /// Create the engine's own bookkeeping tables in `database` if they are missing.
    async fn ensure_tables_exist(&self, database: &str, tables: &[&str]) -> Result<()>;
    /// Insert `rows` into `database`.`table`, skipping rows whose key already exists.
    async fn bulk_insert(&self, database: &str, table: &str, rows: &[Row]) -> Result<u64>;
}

/// Opens sessions on arbitrary servers.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseConnection>>;
    /// Server-level helper for the server `settings` points at.
    async fn helper(&self, settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseHelper>>;
    /// A merge handle and an item service sharing one session.
    async fn merge_session(&self, settings: &ConnectionSettings) -> Result<MergeSession> {
        let connection = self.connect(settings).await?;
        Ok(MergeSession {
            database: Arc::new(crate::store::SqlMergeDatabase::new(connection.clone())),
            items: Arc::new(SqlItemService::new(connection)),
        })
    }
}

/// One side of a merge.
#[derive(Clone)]
pub struct MergeSession {
    pub database: Arc<dyn MergeDatabase>,
    pub items: Arc<dyn ItemService>,
}

#[async_trait::async_trait]
pub trait BranchQueueStore: Send + Sync {
    /// Unstarted rows that are due, ordered by scheduled start then id.
    async fn due_entries(&self) -> Result<Vec<BranchQueueEntry>>;
    async fn get_entry(&self, id: u64) -> Result<Option<BranchQueueEntry>>;
    /// Most recent rows first.
    async fn list_entries(&self, limit: u32) -> Result<Vec<BranchQueueEntry>>;
    async fn enqueue(&self, entry: NewBranchQueueEntry) -> Result<u64>;
    async fn mark_started(&self, id: u64) -> Result<()>;
    async fn update_progress(&self, id: u64, items_processed: u64, total_items: u64) -> Result<()>;
    async fn mark_finished(&self, id: u64, success: bool, errors: &[String]) -> Result<()>;
}

/// Operations a merge needs from one side (branch or production).
///
/// Everything runs on one session so that `lock_tables` and the transaction
/// cover every read and write issued through this handle.
#[async_trait::async_trait]
pub trait MergeDatabase: Send + Sync {
    fn database_name(&self) -> &str;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    /// Exclusive (write) locks on `tables`, replacing any locks held before.
    async fn lock_tables(&self, tables: &[String]) -> Result<()>;
    async fn unlock_tables(&self) -> Result<()>;
    /// The subset of `candidates` that exists in this database.
    async fn existing_tables(&self, candidates: &[String]) -> Result<Vec<String>>;

    /// The change log ordered by id.
    async fn change_log(&self) -> Result<Vec<ChangeLogRecord>>;
    async fn delete_change_log(&self, ids: &[u64]) -> Result<u64>;
    async fn id_mappings(&self) -> Result<Vec<IdMapping>>;
    async fn insert_id_mapping(&self, mapping: &IdMapping) -> Result<()>;

    /// Highest id in `table`, 0 when empty.
    async fn max_id(&self, table: &str) -> Result<u64>;
    /// Look an item up in `{prefix}wiser_item`, then in its archive.
    async fn find_item(&self, prefix: &str, id: u64) -> Result<Option<ItemInfo>>;
    /// Look a link up in `{prefix}wiser_itemlink`, then in its archive.
    async fn find_link(&self, prefix: &str, id: u64) -> Result<Option<LinkInfo>>;
    /// Ids of every branch link with `key`, live rows first, each table in id order.
    async fn find_link_ids(&self, prefix: &str, key: &LinkKey) -> Result<Vec<u64>>;
    /// Table prefixes of the entity types with dedicated item tables, e.g. `product_`.
    async fn dedicated_item_prefixes(&self) -> Result<Vec<String>>;
    async fn read_row(&self, table: &str, id: u64) -> Result<Option<Row>>;

    async fn insert_row(&self, table: &str, row: &Row) -> Result<()>;
    async fn update_field(&self, table: &str, id: u64, field: &str, value: &DbValue) -> Result<u64>;
    async fn delete_row(&self, table: &str, id: u64) -> Result<u64>;
    async fn update_link_field(
        &self,
        prefix: &str,
        key: &LinkKey,
        field: &str,
        value: &DbValue,
    ) -> Result<u64>;
    async fn delete_link(&self, prefix: &str, key: &LinkKey) -> Result<u64>;
    async fn upsert_detail(&self, table: &str, detail: &DetailValue) -> Result<()>;
    async fn delete_detail(&self, table: &str, detail: &DetailValue) -> Result<u64>;
}
