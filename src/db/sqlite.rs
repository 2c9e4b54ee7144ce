//! SQLite engine over `sqlx`.
//!
//! Each [`SqliteEngine::open`] call creates one dedicated `SqliteConnection` for a
//! file. Transactions are driven with raw `BEGIN` / `COMMIT` / `ROLLBACK` statements so
//! the connection can be owned by a pooled handle instead of a borrowed
//! `sqlx::Transaction`.

use crate::db::engine::{Engine, EngineConnection};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, Row};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{Column, ConnectOptions, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Options applied to every connection the engine opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteOptions {
    /// Create the database file if it does not exist (default: true)
    pub create_if_missing: bool,
    /// How long SQLite itself waits on a locked database before reporting BUSY.
    /// Zero hands contention straight to the retry executor.
    pub busy_timeout: Duration,
    /// Use write-ahead logging (default: true)
    pub wal: bool,
    /// Enforce foreign key constraints (default: true)
    pub foreign_keys: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            busy_timeout: Duration::ZERO,
            wal: true,
            foreign_keys: true,
        }
    }
}

/// [`Engine`] implementation for SQLite files.
#[derive(Debug, Clone, Default)]
pub struct SqliteEngine {
    options: SqliteOptions,
}

impl SqliteEngine {
    pub fn new(options: SqliteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    fn connect_options(&self, path: &Path) -> SqliteConnectOptions {
        let journal_mode = if self.options.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(self.options.create_if_missing)
            .busy_timeout(self.options.busy_timeout)
            .foreign_keys(self.options.foreign_keys)
            .journal_mode(journal_mode)
            .disable_statement_logging()
    }
}

impl Engine for SqliteEngine {
    type Connection = SqliteEngineConnection;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self, path: &Path) -> DbResult<SqliteEngineConnection> {
        let conn = self
            .connect_options(path)
            .connect()
            .await
            .map_err(|e| DbError::open(path.display().to_string(), e.to_string()))?;

        debug!(path = %path.display(), "Opened SQLite connection");
        Ok(SqliteEngineConnection { conn })
    }
}

/// One open SQLite connection.
#[derive(Debug)]
pub struct SqliteEngineConnection {
    conn: SqliteConnection,
}

impl SqliteEngineConnection {
    async fn raw(&mut self, sql: &'static str) -> DbResult<()> {
        sqlx::query(sql).execute(&mut self.conn).await?;
        Ok(())
    }
}

impl EngineConnection for SqliteEngineConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        let result = query.execute(&mut self.conn).await?;
        Ok(ExecuteResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        let rows = query.fetch_all(&mut self.conn).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.raw("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.raw("ROLLBACK").await
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

/// Convert a SQLite row into a JSON map keyed by column name.
pub(crate) fn row_to_json(row: &SqliteRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), decode_column(row, idx)))
        .collect()
}

/// Decode one column, dispatching on the value's storage class.
///
/// SQLite is dynamically typed, so the declared column type is only a hint (used for
/// booleans and JSON text); expressions such as `count(*)` have no declared type.
fn decode_column(row: &SqliteRow, idx: usize) -> JsonValue {
    let declared = row.column(idx).type_info().name().to_lowercase();
    let storage = match row.try_get_raw(idx) {
        Ok(value) if value.is_null() => return JsonValue::Null,
        Ok(value) => value.type_info().name().to_lowercase(),
        Err(_) => return JsonValue::Null,
    };

    match storage.as_str() {
        "integer" | "int" | "bigint" | "boolean" if declared == "boolean" || declared == "bool" => {
            decode_boolean(row, idx)
        }
        "integer" | "int" | "bigint" | "boolean" => decode_integer(row, idx),
        "real" | "numeric" => decode_float(row, idx),
        "blob" => decode_binary(row, idx),
        _ => decode_text(row, idx, &declared),
    }
}

fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get_unchecked::<Option<i64>, _>(idx)
        .ok()
        .flatten()
        .map(|v| JsonValue::Number(v.into()))
        .unwrap_or(JsonValue::Null)
}

fn decode_boolean(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get_unchecked::<Option<i64>, _>(idx)
        .ok()
        .flatten()
        .map(|v| JsonValue::Bool(v != 0))
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get_unchecked::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_binary(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get_unchecked::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_text(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
    if let Ok(Some(v)) = row.try_get_unchecked::<Option<String>, _>(idx) {
        if declared.contains("json") {
            if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                return json;
            }
        }
        return JsonValue::String(v);
    }
    JsonValue::Null
}

/// Blobs that are valid UTF-8 become strings, anything else a byte array.
pub(crate) fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
    }
}
