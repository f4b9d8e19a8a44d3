use anyhow::{Context, Result};
use std::sync::Arc;

use crate::model::tables::{
    archive_table_name, normalize_table_prefix, quote_identifier, ITEM_DETAIL_TABLE, ITEM_TABLE,
};
use crate::model::{BranchError, DetailValue, LinkTypeSettings};
use crate::store::DatabaseConnection;

/// Item CRUD that the merge delegates instead of replaying row by row.
#[async_trait::async_trait]
pub trait ItemService: Send + Sync {
    async fn get_all_link_type_settings(&self) -> Result<Vec<LinkTypeSettings>>;
    /// Prefix of the item tables for `entity_type`, `""` for the shared tables.
    async fn get_table_prefix_for_entity(&self, entity_type: &str) -> Result<String>;
    /// Prefix of the link tables for `link_type`, `""` for the shared tables.
    async fn get_table_prefix_for_link(&self, link_type: i64, source_entity_type: &str) -> Result<String>;
    /// Soft delete (or restore, when `undelete`) an item.
    async fn delete(&self, item_id: u64, entity_type: &str, undelete: bool) -> Result<()>;
    async fn get_item_details(&self, prefix: &str, item_id: u64) -> Result<Vec<DetailValue>>;
}

/// [`ItemService`] implemented directly on the Wiser tables.
///
/// Soft deletes move the item and its details into the `_archive` tables and
/// back. It shares its session with the merge handle of the same database.
pub struct SqlItemService {
    connection: Arc<dyn DatabaseConnection>,
}

impl SqlItemService {
    pub fn new(connection: Arc<dyn DatabaseConnection>) -> Self {
        Self { connection }
    }

    async fn move_rows(&self, from: &str, to: &str, column: &str, id: u64) -> Result<u64> {
        let copy = format!(
            "INSERT INTO {} SELECT * FROM {} WHERE {} = ?",
            quote_identifier(to)?,
            quote_identifier(from)?,
            quote_identifier(column)?
        );
        let moved = self.connection.execute(&copy, &[id.into()]).await?;

        let delete = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_identifier(from)?,
            quote_identifier(column)?
        );
        self.connection.execute(&delete, &[id.into()]).await?;
        Ok(moved)
    }
}

#[async_trait::async_trait]
impl ItemService for SqlItemService {
    async fn get_all_link_type_settings(&self) -> Result<Vec<LinkTypeSettings>> {
        let rows = self
            .connection
            .query(
                "SELECT id, type, name, destination_entity_type, connected_entity_type, use_dedicated_table \
                 FROM wiser_link ORDER BY id",
                &[],
            )
            .await
            .context("Failed to read link type settings")?;

        Ok(rows
            .iter()
            .map(|row| LinkTypeSettings {
                id: row.get_u64("id").unwrap_or_default(),
                link_type: row.get_i64("type").unwrap_or_default(),
                name: row.get_string("name").unwrap_or_default(),
                destination_entity_type: row
                    .get_string("destination_entity_type")
                    .unwrap_or_default(),
                source_entity_type: row.get_string("connected_entity_type").unwrap_or_default(),
                use_dedicated_table: row
                    .get("use_dedicated_table")
                    .is_some_and(|v| v.as_bool()),
            })
            .collect())
    }

    async fn get_table_prefix_for_entity(&self, entity_type: &str) -> Result<String> {
        if entity_type.is_empty() {
            return Ok(String::new());
        }
        let rows = self
            .connection
            .query(
                "SELECT dedicated_table_prefix FROM wiser_entity WHERE name = ? LIMIT 1",
                &[entity_type.into()],
            )
            .await
            .with_context(|| format!("Failed to read table prefix of entity type '{}'", entity_type))?;

        Ok(rows
            .first()
            .and_then(|row| row.get_string("dedicated_table_prefix"))
            .map(|prefix| normalize_table_prefix(&prefix))
            .unwrap_or_default())
    }

    async fn get_table_prefix_for_link(&self, link_type: i64, source_entity_type: &str) -> Result<String> {
        let rows = self
            .connection
            .query(
                "SELECT use_dedicated_table FROM wiser_link \
                 WHERE type = ? AND (connected_entity_type = ? OR ? = '') \
                 ORDER BY connected_entity_type = ? DESC LIMIT 1",
                &[
                    link_type.into(),
                    source_entity_type.into(),
                    source_entity_type.into(),
                    source_entity_type.into(),
                ],
            )
            .await
            .with_context(|| format!("Failed to read table prefix of link type {}", link_type))?;

        let dedicated = rows
            .first()
            .and_then(|row| row.get("use_dedicated_table"))
            .is_some_and(|v| v.as_bool());
        Ok(if dedicated {
            format!("{}_", link_type)
        } else {
            String::new()
        })
    }

    async fn delete(&self, item_id: u64, entity_type: &str, undelete: bool) -> Result<()> {
        let prefix = self.get_table_prefix_for_entity(entity_type).await?;
        let item_table = format!("{}{}", prefix, ITEM_TABLE);
        let detail_table = format!("{}{}", prefix, ITEM_DETAIL_TABLE);

        let (item_from, item_to) = if undelete {
            (archive_table_name(&item_table), item_table.clone())
        } else {
            (item_table.clone(), archive_table_name(&item_table))
        };
        let (detail_from, detail_to) = if undelete {
            (archive_table_name(&detail_table), detail_table.clone())
        } else {
            (detail_table.clone(), archive_table_name(&detail_table))
        };

        let moved = self.move_rows(&item_from, &item_to, "id", item_id).await?;
        if moved == 0 {
            return Err(BranchError::NotFound {
                entity: "Item",
                id: item_id,
            }
            .into());
        }
        self.move_rows(&detail_from, &detail_to, "item_id", item_id).await?;
        Ok(())
    }

    async fn get_item_details(&self, prefix: &str, item_id: u64) -> Result<Vec<DetailValue>> {
        let sql = format!(
            "SELECT language_code, groupname, `key`, `value`, long_value FROM {} WHERE item_id = ?",
            quote_identifier(&format!("{}{}", prefix, ITEM_DETAIL_TABLE))?
        );
        let rows = self.connection.query(&sql, &[item_id.into()]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let long_value = row.get_string("long_value").unwrap_or_default();
                DetailValue {
                    owner_column: "item_id",
                    owner_id: item_id,
                    key: row.get_string("key").unwrap_or_default(),
                    language_code: row.get_string("language_code").unwrap_or_default(),
                    group_name: row.get_string("groupname").unwrap_or_default(),
                    value: if long_value.is_empty() {
                        row.get_string("value").unwrap_or_default()
                    } else {
                        long_value
                    },
                }
            })
            .collect())
    }
}
