use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::model::tables::{
    is_archive_table, qualified_name, quote_identifier, ItemTable, ItemTableKind,
    BRANCH_QUEUE_TABLE, COMMUNICATION_TABLE, HISTORY_TABLE, ID_MAPPINGS_TABLE,
};
use crate::model::{
    table_copy_type, CopyMode, CreateBranchSettings, DbValue, EntityCopyRule, LinkTypeSettings,
    Row, TableCopyRule, TableCopyType,
};
use crate::services::{DataSelectorResolver, ItemService};
use crate::store::{DatabaseConnection, DatabaseHelper};

/// Rows per page when copying between servers, and ids per `IN (…)` list.
pub const BATCH_SIZE: u64 = 1000;

/// How rows travel from production to the branch, chosen once per creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// One `INSERT … SELECT` across schemas.
    SameServer,
    /// Read pages from the source and bulk-insert them into the target.
    CrossServer,
}

impl CopyStrategy {
    pub fn for_servers(source_server: &str, target_server: &str) -> Self {
        if source_server.eq_ignore_ascii_case(target_server) {
            CopyStrategy::SameServer
        } else {
            CopyStrategy::CrossServer
        }
    }
}

/// What happens to the data of a cloned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePlan {
    /// Created empty.
    StructureOnly,
    /// Filled from the entity copy rules.
    ItemData,
    /// Copied completely.
    Wholesale,
}

/// Tables whose rows never belong in a new branch.
pub fn is_always_empty(table: &str) -> bool {
    let table = table.to_ascii_lowercase();
    table == HISTORY_TABLE
        || table == COMMUNICATION_TABLE
        || table == BRANCH_QUEUE_TABLE
        || table == ID_MAPPINGS_TABLE
        || table.starts_with("wiser_import")
        || table.contains("token")
        || table.starts_with("log_")
        || table.ends_with("_log")
        || is_archive_table(&table)
}

pub fn classify_table(table: &str, rules: &[TableCopyRule]) -> TablePlan {
    if table_copy_type(rules, table) == TableCopyType::StructureOnly || is_always_empty(table) {
        TablePlan::StructureOnly
    } else if ItemTable::parse(table).is_some() {
        TablePlan::ItemData
    } else {
        TablePlan::Wholesale
    }
}

/// Ids copied into the branch, grouped by table prefix.
///
/// Returned by the item phase and handed to the detail, link and file phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopiedIds {
    by_prefix: BTreeMap<String, BTreeSet<u64>>,
}

impl CopiedIds {
    pub fn add<I: IntoIterator<Item = u64>>(&mut self, prefix: &str, ids: I) {
        self.by_prefix
            .entry(prefix.to_string())
            .or_default()
            .extend(ids);
    }

    pub fn ids(&self, prefix: &str) -> Option<&BTreeSet<u64>> {
        self.by_prefix.get(prefix)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.by_prefix.keys().map(String::as_str)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_prefix.values().any(|ids| ids.contains(&id))
    }

    pub fn total(&self) -> usize {
        self.by_prefix.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub rows: u64,
    pub batches: u64,
}

impl BatchStats {
    fn add(&mut self, other: BatchStats) {
        self.rows += other.rows;
        self.batches += other.batches;
    }
}

#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<Row>>;
}

#[async_trait::async_trait]
pub trait PageSink: Send + Sync {
    async fn write_page(&self, rows: &[Row]) -> Result<u64>;
}

/// Move rows page by page until a short page signals the end.
pub async fn copy_in_batches(
    source: &dyn PageSource,
    sink: &dyn PageSink,
    batch_size: u64,
) -> Result<BatchStats> {
    let mut stats = BatchStats::default();
    let mut offset = 0;
    loop {
        let page = source.fetch_page(offset, batch_size).await?;
        if page.is_empty() {
            break;
        }
        sink.write_page(&page).await?;
        stats.batches += 1;
        stats.rows += page.len() as u64;
        if (page.len() as u64) < batch_size {
            break;
        }
        offset += page.len() as u64;
    }
    Ok(stats)
}

/// A `SELECT` paged with `LIMIT … OFFSET …`. The query needs a stable `ORDER BY`.
pub struct QueryPages<'a> {
    connection: &'a dyn DatabaseConnection,
    sql: String,
    params: Vec<DbValue>,
}

impl<'a> QueryPages<'a> {
    pub fn new(connection: &'a dyn DatabaseConnection, sql: String, params: Vec<DbValue>) -> Self {
        Self {
            connection,
            sql,
            params,
        }
    }
}

#[async_trait::async_trait]
impl PageSource for QueryPages<'_> {
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let sql = format!("{} LIMIT ? OFFSET ?", self.sql);
        let mut params = self.params.clone();
        params.push(limit.into());
        params.push(offset.into());
        self.connection.query(&sql, &params).await
    }
}

pub struct BulkInsertSink<'a> {
    helper: &'a dyn DatabaseHelper,
    database: &'a str,
    table: &'a str,
}

impl<'a> BulkInsertSink<'a> {
    pub fn new(helper: &'a dyn DatabaseHelper, database: &'a str, table: &'a str) -> Self {
        Self {
            helper,
            database,
            table,
        }
    }
}

#[async_trait::async_trait]
impl PageSink for BulkInsertSink<'_> {
    async fn write_page(&self, rows: &[Row]) -> Result<u64> {
        self.helper.bulk_insert(self.database, self.table, rows).await
    }
}

/// Inserts only links whose source item was copied, remembering their ids.
struct LinkSink<'a> {
    inner: BulkInsertSink<'a>,
    copied: &'a CopiedIds,
    link_ids: Mutex<BTreeSet<u64>>,
}

#[async_trait::async_trait]
impl PageSink for LinkSink<'_> {
    async fn write_page(&self, rows: &[Row]) -> Result<u64> {
        let keep: Vec<Row> = rows
            .iter()
            .filter(|row| row.get_u64("item_id").is_some_and(|id| self.copied.contains(id)))
            .cloned()
            .collect();
        self.link_ids
            .lock()
            .extend(keep.iter().filter_map(|row| row.get_u64("id")));
        self.inner.write_page(&keep).await
    }
}

fn id_list(ids: &[u64]) -> String {
    ids.iter().join(", ")
}

/// Totals of one seeding run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub tables_copied: u64,
    pub items_copied: u64,
    pub links_copied: u64,
}

/// Fills a freshly cloned branch with production data.
pub struct DataSeeder {
    source: Arc<dyn DatabaseConnection>,
    target: Arc<dyn DatabaseConnection>,
    target_helper: Arc<dyn DatabaseHelper>,
    items: Arc<dyn ItemService>,
    data_selectors: Arc<dyn DataSelectorResolver>,
    strategy: CopyStrategy,
    target_tables: Vec<String>,
}

impl DataSeeder {
    pub fn new(
        source: Arc<dyn DatabaseConnection>,
        target: Arc<dyn DatabaseConnection>,
        target_helper: Arc<dyn DatabaseHelper>,
        items: Arc<dyn ItemService>,
        data_selectors: Arc<dyn DataSelectorResolver>,
    ) -> Self {
        let strategy = CopyStrategy::for_servers(&source.server_key(), &target.server_key());
        Self {
            source,
            target,
            target_helper,
            items,
            data_selectors,
            strategy,
            target_tables: Vec::new(),
        }
    }

    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    /// Seed every table in `tables` (the tables just created in the target).
    pub async fn seed(&mut self, settings: &CreateBranchSettings, tables: &[String]) -> Result<SeedReport> {
        for rule in &settings.entities {
            rule.validate()?;
        }
        self.target_tables = tables.iter().map(|t| t.to_ascii_lowercase()).collect();
        info!(
            "Seeding '{}' from '{}' ({:?})",
            self.target.database_name(),
            self.source.database_name(),
            self.strategy
        );

        let mut report = SeedReport::default();
        for table in tables {
            if classify_table(table, &settings.tables) == TablePlan::Wholesale {
                let stats = self.copy_where(table, None, Vec::new()).await?;
                debug!("Copied {} row(s) of {}", stats.rows, table);
                report.tables_copied += 1;
            }
        }

        let link_types = self
            .items
            .get_all_link_type_settings()
            .await
            .context("Failed to read link types")?;

        let copied = self.seed_items(&settings.entities, &link_types, &settings.tables).await?;
        report.items_copied = copied.total() as u64;

        self.seed_item_details(&copied, &settings.tables).await?;
        let links = self.seed_links(&copied, &link_types, &settings.tables).await?;
        report.links_copied = links.total() as u64;
        self.seed_link_details(&links, &settings.tables).await?;
        self.seed_files(&copied, &links, &settings.tables).await?;

        info!(
            "Seeded '{}': {} table(s) copied completely, {} item(s), {} link(s)",
            self.target.database_name(),
            report.tables_copied,
            report.items_copied,
            report.links_copied
        );
        Ok(report)
    }

    /// Whether rows may be copied into `table`.
    fn accepts_data(&self, table: &str, rules: &[TableCopyRule]) -> bool {
        self.target_tables.contains(&table.to_ascii_lowercase())
            && classify_table(table, rules) != TablePlan::StructureOnly
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    /// Select and copy items for every rule. The selection of each rule is
    /// its matches, their children and items linked to them.
    pub async fn seed_items(
        &self,
        rules: &[EntityCopyRule],
        link_types: &[LinkTypeSettings],
        table_rules: &[TableCopyRule],
    ) -> Result<CopiedIds> {
        let mut selected = CopiedIds::default();

        for rule in rules {
            let prefix = self.items.get_table_prefix_for_entity(&rule.entity_type).await?;
            let Some(matches) = self.select_matches(rule, &prefix).await? else {
                continue;
            };
            if matches.is_empty() {
                debug!("No items of type '{}' selected", rule.entity_type);
                continue;
            }
            let matches: Vec<u64> = matches.into_iter().collect();
            selected.add(&prefix, matches.iter().copied());

            let items = ItemTableKind::Item.table(&prefix);
            let children = self
                .select_ids(&items, "id", "parent_item_id", &matches, None)
                .await?;
            selected.add(&prefix, children);

            for link_type in link_types
                .iter()
                .filter(|lt| lt.destination_entity_type.eq_ignore_ascii_case(&rule.entity_type))
            {
                let link_prefix = self
                    .items
                    .get_table_prefix_for_link(link_type.link_type, &link_type.source_entity_type)
                    .await?;
                let links = ItemTableKind::ItemLink.table(&link_prefix);
                let sources = self
                    .select_ids(&links, "item_id", "destination_item_id", &matches, Some(link_type.link_type))
                    .await?;
                let source_prefix = self
                    .items
                    .get_table_prefix_for_entity(&link_type.source_entity_type)
                    .await?;
                selected.add(&source_prefix, sources);
            }
        }

        for prefix in selected.prefixes() {
            let items = ItemTableKind::Item.table(prefix);
            if !self.accepts_data(&items, table_rules) {
                continue;
            }
            let ids: Vec<u64> = selected.ids(prefix).into_iter().flatten().copied().collect();
            for chunk in ids.chunks(BATCH_SIZE as usize) {
                let predicate = format!("id IN ({})", id_list(chunk));
                self.copy_where(&items, Some(predicate), Vec::new()).await?;
            }
        }
        Ok(selected)
    }

    /// Ids of the items a rule matches, `None` when the rule is skipped.
    async fn select_matches(&self, rule: &EntityCopyRule, prefix: &str) -> Result<Option<BTreeSet<u64>>> {
        let items = quote_identifier(&ItemTableKind::Item.table(prefix))?;
        let base = format!("SELECT id FROM {} WHERE entity_type = ?", items);
        let mut params: Vec<DbValue> = vec![rule.entity_type.as_str().into()];
        let amount = rule.amount_of_items.unwrap_or(0);

        let sql = match rule.mode {
            CopyMode::Nothing => return Ok(None),
            CopyMode::Everything => base,
            CopyMode::Random => format!("{} ORDER BY RAND() LIMIT {}", base, amount),
            CopyMode::Recent => format!(
                "{} ORDER BY IFNULL(changed_on, added_on) DESC LIMIT {}",
                base, amount
            ),
            CopyMode::CreatedBefore => {
                let Some(bound) = rule.end else {
                    warn!("Copy rule for '{}' needs an end date for CreatedBefore, skipping it", rule.entity_type);
                    return Ok(None);
                };
                params.push(bound.into());
                format!("{} AND added_on < ?", base)
            }
            CopyMode::CreatedAfter => {
                let Some(bound) = rule.start else {
                    warn!("Copy rule for '{}' needs a start date for CreatedAfter, skipping it", rule.entity_type);
                    return Ok(None);
                };
                params.push(bound.into());
                format!("{} AND added_on > ?", base)
            }
            CopyMode::CreatedBetween => {
                let (Some(start), Some(end)) = (rule.start, rule.end) else {
                    warn!("Copy rule for '{}' needs a start and an end for CreatedBetween, skipping it", rule.entity_type);
                    return Ok(None);
                };
                params.push(start.into());
                params.push(end.into());
                format!("{} AND added_on BETWEEN ? AND ?", base)
            }
            CopyMode::DataSelector => {
                let Some(selector) = rule.data_selector else {
                    warn!("Copy rule for '{}' has no data selector, skipping it", rule.entity_type);
                    return Ok(None);
                };
                let ids = self.data_selectors.resolve(selector).await?;
                if ids.is_empty() {
                    return Ok(None);
                }
                let mut found = BTreeSet::new();
                for chunk in ids.chunks(BATCH_SIZE as usize) {
                    let sql = format!("{} AND id IN ({})", base, id_list(chunk));
                    found.extend(self.query_ids(&sql, &params, "id").await?);
                }
                return Ok(Some(found));
            }
        };

        Ok(Some(self.query_ids(&sql, &params, "id").await?.into_iter().collect()))
    }

    /// `SELECT {column} FROM {table} WHERE {key} IN (ids)`, chunked.
    async fn select_ids(
        &self,
        table: &str,
        column: &str,
        key: &str,
        ids: &[u64],
        link_type: Option<i64>,
    ) -> Result<Vec<u64>> {
        if !self.source_has(table).await? {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for chunk in ids.chunks(BATCH_SIZE as usize) {
            let mut sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                quote_identifier(column)?,
                quote_identifier(table)?,
                quote_identifier(key)?,
                id_list(chunk)
            );
            let mut params = Vec::new();
            if let Some(link_type) = link_type {
                sql.push_str(" AND type = ?");
                params.push(link_type.into());
            }
            found.extend(self.query_ids(&sql, &params, column).await?);
        }
        Ok(found)
    }

    async fn query_ids(&self, sql: &str, params: &[DbValue], column: &str) -> Result<Vec<u64>> {
        let rows = self.source.query(sql, params).await?;
        Ok(rows.iter().filter_map(|row| row.get_u64(column)).collect())
    }

    async fn source_has(&self, table: &str) -> Result<bool> {
        let rows = self
            .source
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                &[self.source.database_name().into(), table.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    // -----------------------------------------------------------------------
    // Rows that follow the copied items
    // -----------------------------------------------------------------------

    async fn seed_item_details(&self, copied: &CopiedIds, rules: &[TableCopyRule]) -> Result<()> {
        for prefix in copied.prefixes() {
            let details = ItemTableKind::ItemDetail.table(prefix);
            let items = ItemTableKind::Item.table(prefix);
            if let Some(ids) = copied.ids(prefix) {
                self.copy_by_owner(&details, "item_id", &items, ids, rules).await?;
            }
        }
        Ok(())
    }

    /// Copy links whose both endpoints were copied. Returns the copied link ids.
    async fn seed_links(
        &self,
        copied: &CopiedIds,
        link_types: &[LinkTypeSettings],
        rules: &[TableCopyRule],
    ) -> Result<CopiedIds> {
        let mut prefixes: BTreeSet<String> = BTreeSet::from([String::new()]);
        for link_type in link_types {
            prefixes.insert(
                self.items
                    .get_table_prefix_for_link(link_type.link_type, &link_type.source_entity_type)
                    .await?,
            );
        }

        let all_ids: Vec<u64> = copied
            .prefixes()
            .filter_map(|p| copied.ids(p))
            .flatten()
            .copied()
            .collect();
        let mut links = CopiedIds::default();
        if all_ids.is_empty() {
            return Ok(links);
        }

        for prefix in prefixes {
            let table = ItemTableKind::ItemLink.table(&prefix);
            if !self.accepts_data(&table, rules) {
                continue;
            }
            let columns = self.copy_columns(&table).await?;
            let column_list = columns.iter().map(|c| quote_identifier(c)).collect::<Result<Vec<_>, _>>()?.join(", ");

            match self.strategy {
                CopyStrategy::SameServer => {
                    let copied_items = copied
                        .prefixes()
                        .filter(|p| self.target_tables.contains(&ItemTableKind::Item.table(p)))
                        .map(|p| {
                            qualified_name(self.target.database_name(), &ItemTableKind::Item.table(p))
                                .map(|t| format!("SELECT id FROM {}", t))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                        .join(" UNION ");
                    if copied_items.is_empty() {
                        continue;
                    }
                    let predicate = format!(
                        "item_id IN ({0}) AND destination_item_id IN ({0})",
                        copied_items
                    );
                    self.insert_select(&table, &column_list, Some(&predicate)).await?;
                    let sql = format!(
                        "SELECT id FROM {}",
                        qualified_name(self.target.database_name(), &table)?
                    );
                    let rows = self.target.query(&sql, &[]).await?;
                    links.add(&prefix, rows.iter().filter_map(|row| row.get_u64("id")));
                }
                CopyStrategy::CrossServer => {
                    let sink = LinkSink {
                        inner: BulkInsertSink::new(
                            self.target_helper.as_ref(),
                            self.target.database_name(),
                            &table,
                        ),
                        copied,
                        link_ids: Mutex::new(BTreeSet::new()),
                    };
                    for chunk in all_ids.chunks(BATCH_SIZE as usize) {
                        let sql = format!(
                            "SELECT {} FROM {} WHERE destination_item_id IN ({}) ORDER BY id",
                            column_list,
                            quote_identifier(&table)?,
                            id_list(chunk)
                        );
                        let pages = QueryPages::new(self.source.as_ref(), sql, Vec::new());
                        copy_in_batches(&pages, &sink, BATCH_SIZE).await?;
                    }
                    links.add(&prefix, sink.link_ids.into_inner());
                }
            }
        }
        Ok(links)
    }

    async fn seed_link_details(&self, links: &CopiedIds, rules: &[TableCopyRule]) -> Result<()> {
        for prefix in links.prefixes() {
            let details = ItemTableKind::ItemLinkDetail.table(prefix);
            let owner = ItemTableKind::ItemLink.table(prefix);
            if let Some(ids) = links.ids(prefix) {
                self.copy_by_owner(&details, "itemlink_id", &owner, ids, rules).await?;
            }
        }
        Ok(())
    }

    async fn seed_files(&self, items: &CopiedIds, links: &CopiedIds, rules: &[TableCopyRule]) -> Result<()> {
        for prefix in items.prefixes() {
            let files = ItemTableKind::ItemFile.table(prefix);
            let owner = ItemTableKind::Item.table(prefix);
            if let Some(ids) = items.ids(prefix) {
                self.copy_by_owner(&files, "item_id", &owner, ids, rules).await?;
            }
        }
        for prefix in links.prefixes() {
            let files = ItemTableKind::ItemFile.table(prefix);
            let owner = ItemTableKind::ItemLink.table(prefix);
            if let Some(ids) = links.ids(prefix) {
                self.copy_by_owner(&files, "itemlink_id", &owner, ids, rules).await?;
            }
        }
        Ok(())
    }

    /// Copy the rows of `table` whose `owner_column` points at a copied row.
    async fn copy_by_owner(
        &self,
        table: &str,
        owner_column: &str,
        owner_table: &str,
        ids: &BTreeSet<u64>,
        rules: &[TableCopyRule],
    ) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        if ids.is_empty() || !self.accepts_data(table, rules) {
            return Ok(stats);
        }

        match self.strategy {
            CopyStrategy::SameServer => {
                let predicate = format!(
                    "{} IN (SELECT id FROM {})",
                    quote_identifier(owner_column)?,
                    qualified_name(self.target.database_name(), owner_table)?
                );
                stats.add(self.copy_where(table, Some(predicate), Vec::new()).await?);
            }
            CopyStrategy::CrossServer => {
                let ids: Vec<u64> = ids.iter().copied().collect();
                for chunk in ids.chunks(BATCH_SIZE as usize) {
                    let predicate = format!("{} IN ({})", quote_identifier(owner_column)?, id_list(chunk));
                    stats.add(self.copy_where(table, Some(predicate), Vec::new()).await?);
                }
            }
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Copy primitives
    // -----------------------------------------------------------------------

    /// Non-generated columns of a source table.
    async fn copy_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .source
            .query(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND EXTRA NOT LIKE '%GENERATED%' \
                 ORDER BY ORDINAL_POSITION",
                &[self.source.database_name().into(), table.into()],
            )
            .await
            .with_context(|| format!("Failed to read columns of {}", table))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_string("COLUMN_NAME"))
            .collect())
    }

    async fn insert_select(&self, table: &str, column_list: &str, predicate: Option<&str>) -> Result<u64> {
        let sql = format!(
            "INSERT IGNORE INTO {} ({}) SELECT {} FROM {}{}",
            qualified_name(self.target.database_name(), table)?,
            column_list,
            column_list,
            qualified_name(self.source.database_name(), table)?,
            predicate.map(|p| format!(" WHERE {}", p)).unwrap_or_default()
        );
        self.target
            .execute(&sql, &[])
            .await
            .with_context(|| format!("Failed to copy {}", table))
    }

    /// Copy the rows of `table` matching `predicate` with the chosen strategy.
    async fn copy_where(&self, table: &str, predicate: Option<String>, params: Vec<DbValue>) -> Result<BatchStats> {
        let columns = self.copy_columns(table).await?;
        if columns.is_empty() {
            return Ok(BatchStats::default());
        }
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        match self.strategy {
            CopyStrategy::SameServer => {
                let rows = self.insert_select(table, &column_list, predicate.as_deref()).await?;
                Ok(BatchStats { rows, batches: 1 })
            }
            CopyStrategy::CrossServer => {
                let order_by = if columns.iter().any(|c| c.eq_ignore_ascii_case("id")) {
                    "`id`".to_string()
                } else {
                    column_list.clone()
                };
                let sql = format!(
                    "SELECT {} FROM {}{} ORDER BY {}",
                    column_list,
                    quote_identifier(table)?,
                    predicate.map(|p| format!(" WHERE {}", p)).unwrap_or_default(),
                    order_by
                );
                let pages = QueryPages::new(self.source.as_ref(), sql, params);
                let sink = BulkInsertSink::new(self.target_helper.as_ref(), self.target.database_name(), table);
                copy_in_batches(&pages, &sink, BATCH_SIZE).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_classification() {
        let rules = vec![TableCopyRule {
            table_name: "big_%".into(),
            copy_type: TableCopyType::StructureOnly,
        }];
        assert_eq!(classify_table("wiser_history", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("wiser_item_archive", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("log_requests", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("import_log", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("wiser_user_auth_token", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("big_stats", &rules), TablePlan::StructureOnly);
        assert_eq!(classify_table("product_wiser_itemdetail", &rules), TablePlan::ItemData);
        assert_eq!(classify_table("wiser_entity", &rules), TablePlan::Wholesale);
        assert_eq!(classify_table("catalog", &rules), TablePlan::Wholesale);
    }

    #[test]
    fn test_strategy_by_server() {
        assert_eq!(CopyStrategy::for_servers("db1:3306", "DB1:3306"), CopyStrategy::SameServer);
        assert_eq!(CopyStrategy::for_servers("db1:3306", "db2:3306"), CopyStrategy::CrossServer);
    }

    #[test]
    fn test_copied_ids() {
        let mut copied = CopiedIds::default();
        copied.add("", [1, 2, 2]);
        copied.add("product_", [7]);
        assert_eq!(copied.total(), 3);
        assert!(copied.contains(7));
        assert!(!copied.contains(3));
        assert_eq!(copied.prefixes().collect::<Vec<_>>(), vec!["", "product_"]);
    }
}
