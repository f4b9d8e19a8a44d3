use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};

use crate::model::{BranchQueueEntry, NewBranchQueueEntry};
use crate::store::schema::{BRANCH_QUEUE_DDL, COMMUNICATION_DDL};
use crate::store::traits::BranchQueueStore;

const QUEUE_COLUMNS: &str = "id, name, action, data, start_on, started_on, finished_on, success, errors, \
                             items_processed, total_items, added_by, user_id, added_on";

/// The branch queue, stored in the production database.
///
/// Uses its own pool so progress can be written while the merge sessions
/// hold table locks.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Create a new MySQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create MySQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the queue and communication tables when they are missing.
    pub async fn migrate(&self) -> Result<()> {
        for ddl in [BRANCH_QUEUE_DDL, COMMUNICATION_DDL] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create branch queue tables")?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn entry_from_row(row: &MySqlRow) -> Result<BranchQueueEntry> {
    let action: String = row.try_get("action")?;
    let errors: Option<String> = row.try_get("errors")?;
    let errors = match errors.as_deref().map(str::trim) {
        None | Some("") => Vec::new(),
        Some(json) => serde_json::from_str::<Vec<String>>(json)
            // Older rows hold a single plain-text message.
            .unwrap_or_else(|_| vec![json.to_string()]),
    };
    let id: i32 = row.try_get("id")?;
    let items_processed: i32 = row.try_get("items_processed")?;
    let total_items: i32 = row.try_get("total_items")?;
    let user_id: i64 = row.try_get("user_id")?;
    let success: Option<i8> = row.try_get("success")?;

    Ok(BranchQueueEntry {
        id: id.max(0) as u64,
        name: row.try_get("name")?,
        action: action.parse()?,
        data: row.try_get::<Option<String>, _>("data")?.unwrap_or_default(),
        start_on: row.try_get::<Option<NaiveDateTime>, _>("start_on")?,
        started_on: row.try_get::<Option<NaiveDateTime>, _>("started_on")?,
        finished_on: row.try_get::<Option<NaiveDateTime>, _>("finished_on")?,
        success: success.map(|s| s != 0),
        errors,
        items_processed: items_processed.max(0) as u64,
        total_items: total_items.max(0) as u64,
        added_by: row.try_get("added_by")?,
        user_id: user_id.max(0) as u64,
        added_on: row.try_get::<Option<NaiveDateTime>, _>("added_on")?,
    })
}

fn to_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait::async_trait]
impl BranchQueueStore for MySqlStore {
    async fn due_entries(&self) -> Result<Vec<BranchQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM wiser_branch_queue \
             WHERE started_on IS NULL AND start_on <= NOW() \
             ORDER BY start_on ASC, id ASC",
            QUEUE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch due branch queue entries")?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn get_entry(&self, id: u64) -> Result<Option<BranchQueueEntry>> {
        let sql = format!("SELECT {} FROM wiser_branch_queue WHERE id = ?", QUEUE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch queue entry")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(entry_from_row(&row)?))
    }

    async fn list_entries(&self, limit: u32) -> Result<Vec<BranchQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM wiser_branch_queue ORDER BY id DESC LIMIT ?",
            QUEUE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branch queue entries")?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn enqueue(&self, entry: NewBranchQueueEntry) -> Result<u64> {
        let data = serde_json::to_string(&entry.data).context("Failed to serialize settings")?;
        let result = sqlx::query(
            "INSERT INTO wiser_branch_queue (name, action, data, start_on, added_by, user_id, added_on) \
             VALUES (?, ?, ?, IFNULL(?, NOW()), ?, ?, NOW())",
        )
        .bind(&entry.name)
        .bind(entry.action.to_string())
        .bind(data)
        .bind(entry.start_on)
        .bind(&entry.added_by)
        .bind(entry.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to add branch queue entry")?;

        Ok(result.last_insert_id())
    }

    async fn mark_started(&self, id: u64) -> Result<()> {
        sqlx::query("UPDATE wiser_branch_queue SET started_on = NOW() WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark branch queue entry as started")?;
        Ok(())
    }

    async fn update_progress(&self, id: u64, items_processed: u64, total_items: u64) -> Result<()> {
        sqlx::query("UPDATE wiser_branch_queue SET items_processed = ?, total_items = ? WHERE id = ?")
            .bind(to_i32(items_processed))
            .bind(to_i32(total_items))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update branch queue progress")?;
        Ok(())
    }

    async fn mark_finished(&self, id: u64, success: bool, errors: &[String]) -> Result<()> {
        let errors = serde_json::to_string(errors).context("Failed to serialize errors")?;
        sqlx::query(
            "UPDATE wiser_branch_queue SET finished_on = NOW(), success = ?, errors = ? WHERE id = ?",
        )
        .bind(success)
        .bind(errors)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark branch queue entry as finished")?;
        Ok(())
    }
}
