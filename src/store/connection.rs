use anyhow::{Context, Result};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::model::{ConnectionSettings, DbValue, Row, DEFAULT_MYSQL_PORT};
use crate::store::helper::SqlDatabaseHelper;
use crate::store::traits::{ConnectionFactory, DatabaseConnection, DatabaseHelper};

/// One dedicated MySQL session.
///
/// A pool would hand out a different session per statement, which breaks
/// `LOCK TABLES` and transactions, so this wraps a single connection.
pub struct MySqlConnection {
    inner: Mutex<sqlx::MySqlConnection>,
    database: String,
    server_key: String,
}

impl MySqlConnection {
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self> {
        let options = connect_options(settings);
        let connection = sqlx::MySqlConnection::connect_with(&options)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to MySQL server {} (database '{}')",
                    settings.server_key(),
                    settings.database_name
                )
            })?;

        Ok(Self {
            inner: Mutex::new(connection),
            database: settings.database_name.clone(),
            server_key: settings.server_key(),
        })
    }
}

/// Build connect options; an empty database name connects to the server only.
pub fn connect_options(settings: &ConnectionSettings) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(settings.host.as_deref().unwrap_or("localhost"))
        .port(settings.port.unwrap_or(DEFAULT_MYSQL_PORT))
        .charset("utf8mb4");

    if let Some(username) = &settings.username {
        options = options.username(username);
    }
    if let Some(password) = &settings.password {
        options = options.password(password);
    }
    if !settings.database_name.is_empty() {
        options = options.database(&settings.database_name);
    }
    options
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[DbValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Int(v) => query.bind(*v),
            DbValue::UInt(v) => query.bind(*v),
            DbValue::Float(v) => query.bind(*v),
            DbValue::Text(v) => query.bind(v.clone()),
            DbValue::Bytes(v) => query.bind(v.clone()),
            DbValue::DateTime(v) => query.bind(*v),
        };
    }
    query
}

/// Decode a row without knowing its shape up front.
fn decode_row(row: &MySqlRow) -> Result<Row> {
    let mut decoded = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            decoded.set(column.name(), DbValue::Null);
            continue;
        }

        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = if type_name.ends_with("UNSIGNED") {
            DbValue::UInt(row.try_get_unchecked::<u64, _>(idx)?)
        } else {
            match type_name.as_str() {
                "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                    DbValue::Int(row.try_get_unchecked::<i64, _>(idx)?)
                }
                "FLOAT" => DbValue::Float(row.try_get_unchecked::<f32, _>(idx)? as f64),
                "DOUBLE" => DbValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
                "DATETIME" | "TIMESTAMP" => {
                    DbValue::DateTime(row.try_get_unchecked::<chrono::NaiveDateTime, _>(idx)?)
                }
                "DATE" => {
                    let date = row.try_get_unchecked::<chrono::NaiveDate, _>(idx)?;
                    DbValue::DateTime(date.and_hms_opt(0, 0, 0).unwrap_or_default())
                }
                "TIME" => DbValue::Text(
                    row.try_get_unchecked::<chrono::NaiveTime, _>(idx)?
                        .format("%H:%M:%S")
                        .to_string(),
                ),
                "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY"
                | "BIT" | "GEOMETRY" => DbValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                _ => match row.try_get_unchecked::<String, _>(idx) {
                    Ok(text) => DbValue::Text(text),
                    Err(_) => DbValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                },
            }
        };
        decoded.set(column.name(), value);
    }

    Ok(decoded)
}

#[async_trait::async_trait]
impl DatabaseConnection for MySqlConnection {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn server_key(&self) -> String {
        self.server_key.clone()
    }

    async fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>> {
        let mut connection = self.inner.lock().await;
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *connection)
            .await
            .with_context(|| format!("Query failed on '{}': {}", self.database, sql))?;

        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64> {
        let mut connection = self.inner.lock().await;
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *connection)
            .await
            .with_context(|| format!("Statement failed on '{}': {}", self.database, sql))?;

        Ok(result.rows_affected())
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<u64> {
        let mut connection = self.inner.lock().await;
        let result = connection
            .execute(sql)
            .await
            .with_context(|| format!("Statement failed on '{}': {}", self.database, sql))?;

        Ok(result.rows_affected())
    }
}

/// Opens plain MySQL sessions for branch operations.
#[derive(Debug, Clone, Default)]
pub struct MySqlConnectionFactory;

impl MySqlConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseConnection>> {
        Ok(Arc::new(MySqlConnection::connect(settings).await?))
    }

    async fn helper(&self, settings: &ConnectionSettings) -> Result<Arc<dyn DatabaseHelper>> {
        let connection = MySqlConnection::connect(&settings.with_database("")).await?;
        Ok(Arc::new(SqlDatabaseHelper::new(Arc::new(connection))))
    }
}
