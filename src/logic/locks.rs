use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::model::tables::{
    normalize_table_name, ItemTable, ItemTableKind, HISTORY_TABLE, ID_MAPPINGS_TABLE,
};
use crate::model::ChangeLogRecord;
use crate::store::MergeDatabase;

/// Every table a merge of `records` may read or write, lowercased and sorted.
///
/// `item_prefixes` are the dedicated item table prefixes of the branch; items
/// referenced by links, files and parents may live in any of them.
///
/// Tables that do not exist in one of the databases are filtered out later,
/// per database, by [`TableLockGuard::prepare`].
pub fn compute_lock_set<'a, I>(
    records: &[ChangeLogRecord],
    mapping_tables: I,
    item_prefixes: &[String],
) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tables = BTreeSet::new();
    tables.insert(HISTORY_TABLE.to_string());
    tables.insert(ID_MAPPINGS_TABLE.to_string());
    add_family(&mut tables, "", ItemTableKind::Item);
    for prefix in item_prefixes {
        add_family(&mut tables, &prefix.to_ascii_lowercase(), ItemTableKind::Item);
    }

    for record in records {
        let table = record.table_name.trim().to_ascii_lowercase();
        if table.is_empty() {
            continue;
        }
        match ItemTable::parse(&table) {
            Some(parsed) => {
                add_family(&mut tables, &parsed.prefix, parsed.kind);
                add_family(&mut tables, &parsed.prefix, ItemTableKind::Item);
                match parsed.kind {
                    ItemTableKind::ItemLinkDetail | ItemTableKind::ItemFile => {
                        add_family(&mut tables, &parsed.prefix, ItemTableKind::ItemLink);
                    }
                    ItemTableKind::Item => {
                        add_family(&mut tables, &parsed.prefix, ItemTableKind::ItemDetail);
                    }
                    ItemTableKind::ItemDetail | ItemTableKind::ItemLink => {}
                }
            }
            None => {
                tables.insert(table);
            }
        }
    }

    for table in mapping_tables {
        let table = normalize_table_name(table);
        if let Some(parsed) = ItemTable::parse(&table) {
            add_family(&mut tables, &parsed.prefix, parsed.kind);
        } else {
            tables.insert(table);
        }
    }

    tables.into_iter().collect()
}

fn add_family(tables: &mut BTreeSet<String>, prefix: &str, kind: ItemTableKind) {
    let table = ItemTable {
        prefix: prefix.to_string(),
        kind,
        archive: false,
    };
    tables.insert(table.name());
    tables.insert(table.archive_name());
}

/// Write locks on the branch and production sessions of one merge.
///
/// `LOCK TABLES` replaces whatever a session held before, so acquiring is
/// idempotent. Locks do not survive a lost session and there is no async
/// drop, so callers must run [`TableLockGuard::release`] on every path.
pub struct TableLockGuard {
    branch: Arc<dyn MergeDatabase>,
    production: Arc<dyn MergeDatabase>,
    branch_tables: Vec<String>,
    production_tables: Vec<String>,
    branch_held: bool,
    production_held: bool,
}

impl TableLockGuard {
    /// Resolve `lock_set` against the tables each database actually has.
    pub async fn prepare(
        branch: Arc<dyn MergeDatabase>,
        production: Arc<dyn MergeDatabase>,
        lock_set: &[String],
    ) -> Result<Self> {
        let branch_tables = branch
            .existing_tables(lock_set)
            .await
            .context("Failed to list branch tables")?;
        let production_tables = production
            .existing_tables(lock_set)
            .await
            .context("Failed to list production tables")?;

        Ok(Self {
            branch,
            production,
            branch_tables,
            production_tables,
            branch_held: false,
            production_held: false,
        })
    }

    /// Lock both sides, branch first.
    pub async fn acquire(&mut self) -> Result<()> {
        self.branch
            .lock_tables(&self.branch_tables)
            .await
            .context("Failed to lock branch tables")?;
        self.branch_held = true;
        self.acquire_production().await
    }

    pub async fn acquire_production(&mut self) -> Result<()> {
        self.production
            .lock_tables(&self.production_tables)
            .await
            .context("Failed to lock production tables")?;
        self.production_held = true;
        Ok(())
    }

    /// Unlock production only, for calls that need the whole database.
    pub async fn release_production(&mut self) -> Result<()> {
        if self.production_held {
            self.production.unlock_tables().await?;
            self.production_held = false;
        }
        Ok(())
    }

    /// Unlock both sides. Both unlocks are attempted even when one fails.
    pub async fn release(&mut self) -> Result<()> {
        let production = self.release_production().await;
        let branch = if self.branch_held {
            let result = self.branch.unlock_tables().await;
            self.branch_held = false;
            result
        } else {
            Ok(())
        };
        production.and(branch)
    }

    pub fn production_has(&self, table: &str) -> bool {
        self.production_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn branch_has(&self, table: &str) -> bool {
        self.branch_tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn branch_tables(&self) -> &[String] {
        &self.branch_tables
    }

    pub fn production_tables(&self) -> &[String] {
        &self.production_tables
    }
}
