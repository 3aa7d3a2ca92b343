// ABOUTME: PostgreSQL-backed Source using tokio-postgres with native TLS
// ABOUTME: One client per source; rows are decoded by column type into engine Values

use super::{with_timeout, BatchQuery, Source, SqlDialect};
use crate::utils::sanitize_url;
use crate::value::{Row, Value};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

/// A PostgreSQL database acting as replica source.
///
/// The client is pipelined, so tables sharing one source issue their batch
/// queries over the same connection without blocking each other.
pub struct PostgresSource {
    client: Client,
    url: String,
}

impl PostgresSource {
    /// Connect to `url`. When `allow_self_signed` is set, certificate and
    /// hostname validation are disabled (testing only).
    pub async fn connect(url: &str, allow_self_signed: bool) -> Result<Self> {
        let sanitized = sanitize_url(url);
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(allow_self_signed)
            .danger_accept_invalid_hostnames(allow_self_signed)
            .build()
            .context("Failed to build TLS connector")?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(url, tls)
            .await
            .with_context(|| format!("Failed to connect to source database {}", sanitized))?;

        let log_url = sanitized.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Connection to {} closed with error: {}", log_url, e);
            }
        });

        tracing::info!("Connected to source database {}", sanitized);
        Ok(Self::from_client(client, sanitized))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Underlying client, for setup queries.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connection URL with the password masked.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Source for PostgresSource {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn fetch(&self, query: &BatchQuery, timeout: Duration) -> Result<Vec<Row>> {
        let params: Vec<Box<dyn ToSql + Sync + Send>> = query.params.iter().map(to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = with_timeout(timeout, &query.table, async {
            self.client
                .query(query.sql.as_str(), &refs)
                .await
                .with_context(|| format!("Failed to read batch from {}", query.table))
        })
        .await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        rows.iter()
            .map(|row| {
                let values = (0..columns.len())
                    .map(|idx| column_value(row, idx))
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Failed to decode row from {}", query.table))?;
                Ok(Row::new(Arc::clone(&columns), values))
            })
            .collect()
    }
}

fn to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<i64>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Integer(i) => Box::new(*i),
        Value::Real(r) => Box::new(*r),
        Value::Text(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Timestamp(ts) => Box::new(*ts),
    }
}

fn column_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let name = column.name();
    let ty = column.type_();

    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Integer(v.into())),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Integer(v.into())),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer),
        "oid" => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Integer(v.into())),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Real(v.into())),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(Value::Real),
        "text" | "varchar" | "bpchar" | "name" | "citext" => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::Timestamp),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc())),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        other => anyhow::bail!("Unsupported type {} for column {}", other, name),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_sql_keeps_watermark_value() {
        assert_eq!(format!("{:?}", to_sql(&Value::Integer(42))), "42");
        assert_eq!(format!("{:?}", to_sql(&Value::Null)), "None");
        assert_eq!(format!("{:?}", to_sql(&Value::Bytes(vec![1, 2]))), "[1, 2]");
    }

    #[test]
    fn test_to_sql_accepts_every_value_kind() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Integer(1),
            Value::Real(1.5),
            Value::from("x"),
            Value::Bytes(vec![1]),
            Value::Timestamp(Utc::now()),
        ];
        let bound: Vec<_> = values.iter().map(to_sql).collect();
        assert_eq!(bound.len(), values.len());
    }
}
