use anyhow::{Context, Result};
use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::tables::{
    archive_table_name, normalize_table_prefix, quote_identifier, ENTITY_TABLE, HISTORY_TABLE,
    ID_MAPPINGS_TABLE, ITEM_LINK_TABLE, ITEM_TABLE,
};
use crate::model::{
    ChangeAction, ChangeLogRecord, DbValue, DetailValue, IdMapping, ItemInfo, LinkInfo, LinkKey,
    Row,
};
use crate::store::traits::{DatabaseConnection, MergeDatabase};

/// Statements with an `IN (…)` list are split into chunks of this size.
const IN_LIST_CHUNK: usize = 1000;

/// [`MergeDatabase`] on top of a single MySQL session.
///
/// Transactions are driven with `autocommit` rather than `START TRANSACTION`,
/// because `LOCK TABLES` implicitly commits an open transaction while it
/// leaves `autocommit = 0` intact.
pub struct SqlMergeDatabase {
    connection: Arc<dyn DatabaseConnection>,
    table_exists: Mutex<HashMap<String, bool>>,
    generated_columns: Mutex<HashMap<String, Vec<String>>>,
}

impl SqlMergeDatabase {
    pub fn new(connection: Arc<dyn DatabaseConnection>) -> Self {
        Self {
            connection,
            table_exists: Mutex::new(HashMap::new()),
            generated_columns: Mutex::new(HashMap::new()),
        }
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        let key = table.to_ascii_lowercase();
        if let Some(exists) = self.table_exists.lock().get(&key) {
            return Ok(*exists);
        }

        let rows = self
            .connection
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                &[self.connection.database_name().into(), table.into()],
            )
            .await?;
        let exists = !rows.is_empty();
        self.table_exists.lock().insert(key, exists);
        Ok(exists)
    }

    async fn generated_columns(&self, table: &str) -> Result<Vec<String>> {
        let key = table.to_ascii_lowercase();
        if let Some(columns) = self.generated_columns.lock().get(&key) {
            return Ok(columns.clone());
        }

        let rows = self
            .connection
            .query(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND EXTRA LIKE '%GENERATED%'",
                &[self.connection.database_name().into(), table.into()],
            )
            .await?;
        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_string("COLUMN_NAME"))
            .collect();
        self.generated_columns.lock().insert(key, columns.clone());
        Ok(columns)
    }

    /// The live table followed by its archive, when the archive exists.
    async fn live_and_archive(&self, table: &str) -> Result<Vec<(String, bool)>> {
        let mut tables = vec![(table.to_string(), false)];
        let archive = archive_table_name(table);
        if self.has_table(&archive).await? {
            tables.push((archive, true));
        }
        Ok(tables)
    }
}

fn link_predicate() -> &'static str {
    "item_id = ? AND destination_item_id = ? AND type = ?"
}

fn link_params(key: &LinkKey) -> Vec<DbValue> {
    vec![key.source.into(), key.destination.into(), key.link_type.into()]
}

fn parse_change_log_row(row: &Row) -> Result<ChangeLogRecord> {
    let id = row.get_u64("id").unwrap_or_default();
    let verb = row.get_string("action").unwrap_or_default();
    let action: ChangeAction = verb
        .parse()
        .with_context(|| format!("Change-log record #{} cannot be replayed", id))?;

    Ok(ChangeLogRecord {
        id,
        action,
        table_name: row.get_string("tablename").unwrap_or_default(),
        item_id: row.get_u64("item_id").unwrap_or_default(),
        field: row.get_string("field").unwrap_or_default(),
        old_value: row.get_string("oldvalue"),
        new_value: row.get_string("newvalue"),
        language_code: row.get_string("language_code").unwrap_or_default(),
        group_name: row.get_string("groupname").unwrap_or_default(),
        changed_by: row.get_string("changed_by").unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl MergeDatabase for SqlMergeDatabase {
    fn database_name(&self) -> &str {
        self.connection.database_name()
    }

    async fn begin(&self) -> Result<()> {
        self.connection.execute_unprepared("SET autocommit = 0").await?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.connection.execute_unprepared("COMMIT").await?;
        self.connection.execute_unprepared("SET autocommit = 1").await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.connection.execute_unprepared("ROLLBACK").await?;
        self.connection.execute_unprepared("SET autocommit = 1").await?;
        Ok(())
    }

    async fn lock_tables(&self, tables: &[String]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let list = tables
            .iter()
            .map(|t| quote_identifier(t).map(|q| format!("{} WRITE", q)))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        self.connection
            .execute_unprepared(&format!("LOCK TABLES {}", list))
            .await
            .context("Failed to lock tables")?;
        Ok(())
    }

    async fn unlock_tables(&self) -> Result<()> {
        self.connection.execute_unprepared("UNLOCK TABLES").await?;
        Ok(())
    }

    async fn existing_tables(&self, candidates: &[String]) -> Result<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .connection
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES WHERE TABLE_SCHEMA = ?",
                &[self.connection.database_name().into()],
            )
            .await?;
        let present: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_string("TABLE_NAME"))
            .map(|name| name.to_ascii_lowercase())
            .collect();

        let mut cache = self.table_exists.lock();
        Ok(candidates
            .iter()
            .filter(|candidate| {
                let key = candidate.to_ascii_lowercase();
                let exists = present.contains(&key);
                cache.insert(key, exists);
                exists
            })
            .cloned()
            .collect())
    }

    async fn change_log(&self) -> Result<Vec<ChangeLogRecord>> {
        let sql = format!(
            "SELECT id, action, tablename, item_id, field, oldvalue, newvalue, language_code, groupname, changed_by \
             FROM {} ORDER BY id ASC",
            quote_identifier(HISTORY_TABLE)?
        );
        let rows = self
            .connection
            .query(&sql, &[])
            .await
            .context("Failed to read the change log")?;
        rows.iter().map(parse_change_log_row).collect()
    }

    async fn delete_change_log(&self, ids: &[u64]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                quote_identifier(HISTORY_TABLE)?,
                vec!["?"; chunk.len()].join(", ")
            );
            let params: Vec<DbValue> = chunk.iter().map(|id| (*id).into()).collect();
            deleted += self.connection.execute(&sql, &params).await?;
        }
        Ok(deleted)
    }

    async fn id_mappings(&self) -> Result<Vec<IdMapping>> {
        if !self.has_table(ID_MAPPINGS_TABLE).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT table_name, our_id, production_id FROM {}",
            quote_identifier(ID_MAPPINGS_TABLE)?
        );
        let rows = self
            .connection
            .query(&sql, &[])
            .await
            .context("Failed to read id mappings")?;
        Ok(rows
            .iter()
            .map(|row| IdMapping {
                table_name: row.get_string("table_name").unwrap_or_default(),
                our_id: row.get_u64("our_id").unwrap_or_default(),
                production_id: row.get_u64("production_id").unwrap_or_default(),
            })
            .collect())
    }

    async fn insert_id_mapping(&self, mapping: &IdMapping) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, our_id, production_id) VALUES (?, ?, ?)",
            quote_identifier(ID_MAPPINGS_TABLE)?
        );
        self.connection
            .execute(
                &sql,
                &[
                    mapping.table_name.as_str().into(),
                    mapping.our_id.into(),
                    mapping.production_id.into(),
                ],
            )
            .await
            .context("Failed to store id mapping")?;
        Ok(())
    }

    async fn max_id(&self, table: &str) -> Result<u64> {
        if !self.has_table(table).await? {
            return Ok(0);
        }
        let sql = format!(
            "SELECT IFNULL(MAX(id), 0) AS max_id FROM {}",
            quote_identifier(table)?
        );
        let rows = self.connection.query(&sql, &[]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_u64("max_id"))
            .unwrap_or_default())
    }

    async fn find_item(&self, prefix: &str, id: u64) -> Result<Option<ItemInfo>> {
        let table = format!("{}{}", prefix, ITEM_TABLE);
        for (candidate, archived) in self.live_and_archive(&table).await? {
            let sql = format!(
                "SELECT id, entity_type FROM {} WHERE id = ?",
                quote_identifier(&candidate)?
            );
            let rows = self.connection.query(&sql, &[id.into()]).await?;
            if let Some(row) = rows.first() {
                return Ok(Some(ItemInfo {
                    id,
                    entity_type: row.get_string("entity_type").unwrap_or_default(),
                    table_prefix: prefix.to_string(),
                    deleted: archived,
                }));
            }
        }
        Ok(None)
    }

    async fn find_link(&self, prefix: &str, id: u64) -> Result<Option<LinkInfo>> {
        let table = format!("{}{}", prefix, ITEM_LINK_TABLE);
        for (candidate, _) in self.live_and_archive(&table).await? {
            let sql = format!(
                "SELECT id, item_id, destination_item_id, type, ordering FROM {} WHERE id = ?",
                quote_identifier(&candidate)?
            );
            let rows = self.connection.query(&sql, &[id.into()]).await?;
            if let Some(row) = rows.first() {
                return Ok(Some(LinkInfo {
                    id,
                    source: row.get_u64("item_id").unwrap_or_default(),
                    destination: row.get_u64("destination_item_id").unwrap_or_default(),
                    link_type: row.get_i64("type").unwrap_or_default(),
                    ordering: row.get_i64("ordering").unwrap_or_default(),
                }));
            }
        }
        Ok(None)
    }

    async fn find_link_ids(&self, prefix: &str, key: &LinkKey) -> Result<Vec<u64>> {
        let table = format!("{}{}", prefix, ITEM_LINK_TABLE);
        let mut ids = Vec::new();
        for (candidate, _) in self.live_and_archive(&table).await? {
            let sql = format!(
                "SELECT id FROM {} WHERE {} ORDER BY id",
                quote_identifier(&candidate)?,
                link_predicate()
            );
            let rows = self.connection.query(&sql, &link_params(key)).await?;
            ids.extend(rows.iter().filter_map(|row| row.get_u64("id")));
        }
        Ok(ids)
    }

    async fn dedicated_item_prefixes(&self) -> Result<Vec<String>> {
        if !self.has_table(ENTITY_TABLE).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT dedicated_table_prefix FROM {} \
             WHERE IFNULL(dedicated_table_prefix, '') <> ''",
            quote_identifier(ENTITY_TABLE)?
        );
        let rows = self
            .connection
            .query(&sql, &[])
            .await
            .context("Failed to read dedicated table prefixes")?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_string("dedicated_table_prefix"))
            .map(|prefix| normalize_table_prefix(&prefix))
            .unique()
            .collect())
    }

    async fn read_row(&self, table: &str, id: u64) -> Result<Option<Row>> {
        if !self.has_table(table).await? {
            return Ok(None);
        }
        let sql = format!("SELECT * FROM {} WHERE id = ?", quote_identifier(table)?);
        let rows = self.connection.query(&sql, &[id.into()]).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_row(&self, table: &str, row: &Row) -> Result<()> {
        let generated = self.generated_columns(table).await?;
        let mut columns = Vec::new();
        let mut params = Vec::new();
        for (column, value) in row.iter() {
            if generated.iter().any(|g| g.eq_ignore_ascii_case(column)) {
                continue;
            }
            columns.push(quote_identifier(column)?);
            params.push(value.clone());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table)?,
            columns.join(", "),
            vec!["?"; params.len()].join(", ")
        );
        self.connection
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to insert into {}", table))?;
        Ok(())
    }

    async fn update_field(&self, table: &str, id: u64, field: &str, value: &DbValue) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE id = ?",
            quote_identifier(table)?,
            quote_identifier(field)?
        );
        self.connection.execute(&sql, &[value.clone(), id.into()]).await
    }

    async fn delete_row(&self, table: &str, id: u64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE id = ?", quote_identifier(table)?);
        self.connection.execute(&sql, &[id.into()]).await
    }

    async fn update_link_field(
        &self,
        prefix: &str,
        key: &LinkKey,
        field: &str,
        value: &DbValue,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {}",
            quote_identifier(&format!("{}{}", prefix, ITEM_LINK_TABLE))?,
            quote_identifier(field)?,
            link_predicate()
        );
        let mut params = vec![value.clone()];
        params.extend(link_params(key));
        self.connection.execute(&sql, &params).await
    }

    async fn delete_link(&self, prefix: &str, key: &LinkKey) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&format!("{}{}", prefix, ITEM_LINK_TABLE))?,
            link_predicate()
        );
        self.connection.execute(&sql, &link_params(key)).await
    }

    async fn upsert_detail(&self, table: &str, detail: &DetailValue) -> Result<()> {
        let (value, long_value) = detail.storage_columns();
        let sql = format!(
            "INSERT INTO {} ({}, language_code, groupname, `key`, `value`, long_value) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE `value` = VALUES(`value`), long_value = VALUES(long_value)",
            quote_identifier(table)?,
            quote_identifier(detail.owner_column)?
        );
        self.connection
            .execute(
                &sql,
                &[
                    detail.owner_id.into(),
                    detail.language_code.as_str().into(),
                    detail.group_name.as_str().into(),
                    detail.key.as_str().into(),
                    value.into(),
                    long_value.into(),
                ],
            )
            .await
            .with_context(|| format!("Failed to save detail '{}' in {}", detail.key, table))?;
        Ok(())
    }

    async fn delete_detail(&self, table: &str, detail: &DetailValue) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ? AND `key` = ? AND language_code = ? AND groupname = ?",
            quote_identifier(table)?,
            quote_identifier(detail.owner_column)?
        );
        self.connection
            .execute(
                &sql,
                &[
                    detail.owner_id.into(),
                    detail.key.as_str().into(),
                    detail.language_code.as_str().into(),
                    detail.group_name.as_str().into(),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_change_log_row() {
        let row = Row::new()
            .with("id", 12u64)
            .with("action", "ADD_LINK")
            .with("tablename", "wiser_itemlink")
            .with("item_id", 5u64)
            .with("field", "1,3")
            .with("oldvalue", DbValue::Null)
            .with("newvalue", "4");
        let record = parse_change_log_row(&row).unwrap();
        assert_eq!(record.action, ChangeAction::AddLink);
        assert_eq!(record.old_value, None);
        assert_eq!(record.new_value_id().unwrap(), 4);
        assert_eq!(record.link_type_and_ordering().unwrap(), (1, 3));
    }

    #[test]
    fn test_unknown_verbs_fail_loading() {
        let row = Row::new().with("id", 3u64).with("action", "REBASE_ITEM");
        assert!(parse_change_log_row(&row).is_err());
    }
}
