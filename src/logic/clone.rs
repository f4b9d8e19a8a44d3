use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::model::tables::{quote_identifier, ITEM_FILE_TABLE};
use crate::model::{table_copy_type, TableCopyRule, TableCopyType};
use crate::store::DatabaseConnection;

/// Copies table structure, triggers and routines from one schema to another.
pub struct SchemaCloner {
    source: Arc<dyn DatabaseConnection>,
    target: Arc<dyn DatabaseConnection>,
}

/// Order tables by name, with item-file tables last.
pub fn order_tables(mut tables: Vec<String>) -> Vec<String> {
    tables.sort_by_key(|t| t.to_ascii_lowercase());
    let (files, others): (Vec<String>, Vec<String>) = tables
        .into_iter()
        .partition(|t| t.to_ascii_lowercase().contains(ITEM_FILE_TABLE));
    others.into_iter().chain(files).collect()
}

/// Replace the `DEFINER=…` clause of a routine or trigger with `CURRENT_USER`,
/// since the original definer may not exist on the target server.
pub fn rewrite_definer(ddl: &str) -> String {
    const CLAUSE: &str = "DEFINER=";
    let upper = ddl.to_ascii_uppercase();
    let Some(start) = upper.find(CLAUSE) else {
        return ddl.to_string();
    };
    let rest = &ddl[start + CLAUSE.len()..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    format!("{}{}CURRENT_USER{}", &ddl[..start], CLAUSE, &rest[end..])
}

impl SchemaCloner {
    pub fn new(source: Arc<dyn DatabaseConnection>, target: Arc<dyn DatabaseConnection>) -> Self {
        Self { source, target }
    }

    async fn base_tables(connection: &dyn DatabaseConnection) -> Result<Vec<String>> {
        let rows = connection
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
                &[connection.database_name().into()],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_string("TABLE_NAME"))
            .collect())
    }

    /// Source tables to recreate, in creation order.
    pub async fn tables_to_clone(&self, rules: &[TableCopyRule]) -> Result<Vec<String>> {
        let tables = Self::base_tables(self.source.as_ref())
            .await
            .context("Failed to list source tables")?
            .into_iter()
            .filter(|t| !t.starts_with('_'))
            .filter(|t| table_copy_type(rules, t) != TableCopyType::Nothing)
            .collect();
        Ok(order_tables(tables))
    }

    pub async fn clone_tables(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            let sql = format!("SHOW CREATE TABLE {}", quote_identifier(table)?);
            let rows = self.source.query(&sql, &[]).await?;
            let ddl = rows
                .first()
                .and_then(|row| row.get_string("Create Table"))
                .ok_or_else(|| anyhow!("No definition returned for table {}", table))?;
            self.target
                .execute_unprepared(&ddl)
                .await
                .with_context(|| format!("Failed to create table {}", table))?;
            debug!("Created table {}", table);
        }
        info!(
            "Created {} table(s) in '{}'",
            tables.len(),
            self.target.database_name()
        );
        Ok(())
    }

    /// Recreate triggers on tables that exist in the target. Runs after
    /// seeding so copying data does not fill the change log.
    pub async fn clone_triggers(&self) -> Result<usize> {
        let target_tables: Vec<String> = Self::base_tables(self.target.as_ref())
            .await?
            .into_iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let rows = self
            .source
            .query(
                "SELECT TRIGGER_NAME, EVENT_MANIPULATION, EVENT_OBJECT_TABLE, ACTION_STATEMENT, \
                 ACTION_TIMING, ACTION_ORIENTATION FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = ? ORDER BY EVENT_OBJECT_TABLE, ACTION_ORDER",
                &[self.source.database_name().into()],
            )
            .await
            .context("Failed to list triggers")?;

        let mut created = 0;
        for row in rows {
            let table = row.get_string("EVENT_OBJECT_TABLE").unwrap_or_default();
            if !target_tables.contains(&table.to_ascii_lowercase()) {
                continue;
            }
            let name = row.get_string("TRIGGER_NAME").unwrap_or_default();
            let ddl = format!(
                "CREATE TRIGGER {} {} {} ON {} FOR EACH {} {}",
                quote_identifier(&name)?,
                row.get_string("ACTION_TIMING").unwrap_or_default(),
                row.get_string("EVENT_MANIPULATION").unwrap_or_default(),
                quote_identifier(&table)?,
                row.get_string("ACTION_ORIENTATION").unwrap_or_else(|| "ROW".to_string()),
                row.get_string("ACTION_STATEMENT").unwrap_or_default()
            );
            self.target
                .execute_unprepared(&ddl)
                .await
                .with_context(|| format!("Failed to create trigger {}", name))?;
            created += 1;
        }
        info!("Created {} trigger(s) in '{}'", created, self.target.database_name());
        Ok(created)
    }

    pub async fn clone_routines(&self) -> Result<usize> {
        let rows = self
            .source
            .query(
                "SELECT ROUTINE_NAME, ROUTINE_TYPE FROM information_schema.ROUTINES \
                 WHERE ROUTINE_SCHEMA = ? ORDER BY ROUTINE_NAME",
                &[self.source.database_name().into()],
            )
            .await
            .context("Failed to list stored routines")?;

        let mut created = 0;
        for row in rows {
            let name = row.get_string("ROUTINE_NAME").unwrap_or_default();
            let kind = match row.get_string("ROUTINE_TYPE").as_deref() {
                Some("FUNCTION") => "FUNCTION",
                _ => "PROCEDURE",
            };
            let show = format!("SHOW CREATE {} {}", kind, quote_identifier(&name)?);
            let definition = self.source.query(&show, &[]).await?;
            let column = if kind == "FUNCTION" {
                "Create Function"
            } else {
                "Create Procedure"
            };
            let Some(ddl) = definition.first().and_then(|r| r.get_string(column)) else {
                // NULL when the current user may not read the body.
                warn!("Skipping {} {}: definition not readable", kind, name);
                continue;
            };
            self.target
                .execute_unprepared(&rewrite_definer(&ddl))
                .await
                .with_context(|| format!("Failed to create {} {}", kind, name))?;
            created += 1;
        }
        info!("Created {} routine(s) in '{}'", created, self.target.database_name());
        Ok(created)
    }
}
