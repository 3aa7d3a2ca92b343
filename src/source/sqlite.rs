// ABOUTME: SQLite-backed Source using rusqlite on the blocking thread pool
// ABOUTME: Converts rusqlite values to engine Values and binds watermark parameters

use super::{with_timeout, BatchQuery, Source, SqlDialect};
use crate::value::{Row, Value};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqliteValue;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default time a query waits on a locked database before failing.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A SQLite database file (or in-memory database) acting as replica source.
///
/// Queries run one at a time on tokio's blocking pool; the connection lives for
/// the lifetime of the source and is shared by every table reading from it.
#[derive(Clone)]
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
    label: String,
}

impl SqliteSource {
    /// Open a database file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("Failed to set SQLite busy timeout")?;
        tracing::debug!("Opened SQLite source {}", path.display());
        Ok(Self::with_label(conn, path.display().to_string()))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self::with_label(conn, "sqlite".to_string())
    }

    fn with_label(conn: Connection, label: String) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            label,
        }
    }

    /// Run statements against the source connection (setup, fixtures).
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .execute_batch(&sql)
                .context("Failed to execute SQLite statements")
        })
        .await
        .context("SQLite task panicked")?
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl Source for SqliteSource {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn fetch(&self, query: &BatchQuery, timeout: Duration) -> Result<Vec<Row>> {
        let conn = Arc::clone(&self.conn);
        let sql = query.sql.clone();
        let table = query.table.clone();
        let params: Vec<SqliteValue> = query.params.iter().map(to_sqlite).collect();

        let task = tokio::task::spawn_blocking(move || -> Result<Vec<Row>> {
            let conn = conn.lock();
            if !timeout.is_zero() {
                conn.busy_timeout(timeout)
                    .context("Failed to set SQLite busy timeout")?;
            }
            query_rows(&conn, &sql, &params)
                .with_context(|| format!("Failed to read batch from {}", table))
        });

        with_timeout(timeout, &query.table, async move {
            task.await
                .context("SQLite task panicked")
                .and_then(|rows| rows)
        })
        .await
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqliteValue]) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare_cached(sql)
        .context("Failed to prepare batch query")?;
    let columns: Arc<[String]> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let value: SqliteValue = row.get(idx)?;
                values.push(from_sqlite(value));
            }
            Ok(values)
        })
        .context("Failed to execute batch query")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect batch rows")?;

    Ok(rows
        .into_iter()
        .map(|values| Row::new(Arc::clone(&columns), values))
        .collect())
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqliteValue::Integer(*i),
        Value::Real(r) => SqliteValue::Real(*r),
        Value::Text(s) => SqliteValue::Text(s.clone()),
        Value::Bytes(b) => SqliteValue::Blob(b.clone()),
        Value::Timestamp(ts) => SqliteValue::Text(ts.to_rfc3339()),
    }
}

fn from_sqlite(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(i) => Value::Integer(i),
        SqliteValue::Real(r) => Value::Real(r),
        SqliteValue::Text(s) => Value::Text(s),
        SqliteValue::Blob(b) => Value::Bytes(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str, since: i64, limit: i64) -> BatchQuery {
        BatchQuery {
            sql: sql.to_string(),
            params: vec![Value::Integer(since), Value::Integer(limit)],
            table: "items".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_ordered_bounded_rows() {
        let source = SqliteSource::from_connection(Connection::open_in_memory().unwrap());
        source
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, payload BLOB);
                 INSERT INTO items (id, name, payload) VALUES (1, 'a', x'00'), (2, 'b', NULL), (3, 'c', x'0102');",
            )
            .await
            .unwrap();

        let rows = source
            .fetch(
                &query(
                    "SELECT id, name, payload FROM items WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                    1,
                    10,
                ),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(2)));
        assert_eq!(rows[0].get("payload"), Some(&Value::Null));
        assert_eq!(rows[1].get("payload"), Some(&Value::Bytes(vec![1, 2])));
        assert_eq!(rows[1].columns(), ["id", "name", "payload"]);
    }

    #[tokio::test]
    async fn test_fetch_error_carries_table_context() {
        let source = SqliteSource::from_connection(Connection::open_in_memory().unwrap());
        let err = source
            .fetch(
                &query("SELECT * FROM missing WHERE id > ?1 LIMIT ?2", 0, 1),
                Duration::ZERO,
            )
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read batch from items"));
    }

    #[test]
    fn test_value_conversion_round_trip_kinds() {
        assert_eq!(to_sqlite(&Value::Bool(true)), SqliteValue::Integer(1));
        assert_eq!(from_sqlite(SqliteValue::Blob(vec![9])), Value::Bytes(vec![9]));
    }
}
