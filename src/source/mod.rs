// ABOUTME: Boundary to the external tabular source the replicas mirror
// ABOUTME: A Source executes one bounded, parameterised batch query and returns rows

pub mod dialect;
pub mod postgres;
pub mod sqlite;

pub use dialect::{ParamKind, SqlDialect};
pub use postgres::PostgresSource;
pub use sqlite::SqliteSource;

use crate::value::{Row, Value};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A fully rendered batch query and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchQuery {
    /// Query text in the source's dialect.
    pub sql: String,
    /// Positional parameters: the watermark bound, then the batch size.
    pub params: Vec<Value>,
    /// Qualified table name, for error context.
    pub table: String,
}

/// An external table store that can answer watermark-bounded scans.
///
/// Implementations own whatever connection they need and must release any
/// per-query resources on every exit path, including when the returned future
/// is dropped mid-flight by cancellation.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Dialect used to render queries for this source.
    fn dialect(&self) -> SqlDialect;

    /// Execute `query`, giving up after `timeout` (zero means no limit).
    async fn fetch(&self, query: &BatchQuery, timeout: Duration) -> Result<Vec<Row>>;
}

/// Run `fut` under `timeout`, treating zero as unlimited.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, table: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("Timed out after {:?} reading batch from {}", timeout, table),
    }
}
