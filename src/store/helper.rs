use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::model::tables::{qualified_name, quote_identifier};
use crate::model::{DbValue, Row};
use crate::store::schema::bookkeeping_ddl;
use crate::store::traits::{DatabaseConnection, DatabaseHelper};

/// MySQL caps a prepared statement at 65535 placeholders.
const MAX_PLACEHOLDERS: usize = 65_535;

/// Server-level operations over a connection that is not bound to a schema.
pub struct SqlDatabaseHelper {
    connection: Arc<dyn DatabaseConnection>,
}

impl SqlDatabaseHelper {
    pub fn new(connection: Arc<dyn DatabaseConnection>) -> Self {
        Self { connection }
    }
}

/// Multi-row `INSERT IGNORE` statements, split so no statement exceeds the
/// placeholder limit. Every row must have the columns of the first row.
pub fn bulk_insert_statements(
    database: &str,
    table: &str,
    rows: &[Row],
) -> Result<Vec<(String, Vec<DbValue>)>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };

    let columns = first.columns().to_vec();
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let target = qualified_name(database, table)?;
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let rows_per_statement = (MAX_PLACEHOLDERS / columns.len().max(1)).max(1);

    let mut statements = Vec::new();
    for chunk in rows.chunks(rows_per_statement) {
        let mut params = Vec::with_capacity(chunk.len() * columns.len());
        for row in chunk {
            for column in &columns {
                let value = row
                    .get(column)
                    .ok_or_else(|| anyhow!("Row for {} is missing column {}", table, column))?;
                params.push(value.clone());
            }
        }
        let sql = format!(
            "INSERT IGNORE INTO {} ({}) VALUES {}",
            target,
            column_list,
            vec![placeholders.as_str(); chunk.len()].join(", ")
        );
        statements.push((sql, params));
    }
    Ok(statements)
}

#[async_trait::async_trait]
impl DatabaseHelper for SqlDatabaseHelper {
    async fn database_exists(&self, name: &str) -> Result<bool> {
        let rows = self
            .connection
            .query(
                "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
                &[name.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE {} CHARACTER SET utf8mb4 COLLATE utf8mb4_general_ci",
            quote_identifier(name)?
        );
        self.connection.execute_unprepared(&sql).await?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)?);
        self.connection.execute_unprepared(&sql).await?;
        Ok(())
    }

    async fn ensure_tables_exist(&self, database: &str, tables: &[&str]) -> Result<()> {
        self.connection
            .execute_unprepared(&format!("USE {}", quote_identifier(database)?))
            .await?;
        for table in tables {
            let ddl = bookkeeping_ddl(table)
                .ok_or_else(|| anyhow!("No table definition known for {}", table))?;
            self.connection.execute_unprepared(ddl).await?;
        }
        Ok(())
    }

    async fn bulk_insert(&self, database: &str, table: &str, rows: &[Row]) -> Result<u64> {
        let mut inserted = 0;
        for (sql, params) in bulk_insert_statements(database, table, rows)? {
            inserted += self.connection.execute(&sql, &params).await?;
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_insert_statement_shape() {
        let rows: Vec<Row> = (1..=3u64)
            .map(|id| Row::new().with("id", id).with("title", format!("item {}", id)))
            .collect();

        let statements = bulk_insert_statements("branch", "wiser_item", &rows).unwrap();
        assert_eq!(statements.len(), 1);
        let (sql, params) = &statements[0];
        assert_eq!(
            sql,
            "INSERT IGNORE INTO `branch`.`wiser_item` (`id`, `title`) VALUES (?, ?), (?, ?), (?, ?)"
        );
        assert_eq!(params.len(), 6);
        assert_eq!(params[2], DbValue::UInt(2));
    }

    #[test]
    fn test_bulk_insert_splits_on_placeholder_limit() {
        let rows: Vec<Row> = (0..40_000u64).map(|id| Row::new().with("a", id).with("b", id)).collect();
        let statements = bulk_insert_statements("db", "t", &rows).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|(_, params)| params.len() <= MAX_PLACEHOLDERS));
    }

    #[test]
    fn test_empty_insert_is_noop() {
        assert!(bulk_insert_statements("db", "t", &[]).unwrap().is_empty());
    }
}
