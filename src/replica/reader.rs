// ABOUTME: BatchReader - one bounded, watermark-ordered fetch from a source table
// ABOUTME: Builds the quoted batch query once and decodes rows into typed records

use crate::config::{ReplicaConfig, WatermarkBound, WatermarkMode};
use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{Entity, MappedRow, SchemaRegistry, TypeSchema};
use crate::source::{BatchQuery, ParamKind, Source};
use crate::utils::sanitize_identifier;
use crate::value::{Row, Value};
use crate::watermark::{Watermark, WatermarkCodec};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Per-table overrides applied on top of the entity descriptor and the
/// shared [`ReplicaConfig`].
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    table: Option<String>,
    watermark: Option<WatermarkMode>,
    tombstone_column: Option<Option<String>>,
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from `table` instead of the descriptor's table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn watermark(mut self, mode: WatermarkMode) -> Self {
        self.watermark = Some(mode);
        self
    }

    pub fn tombstone_column(mut self, column: impl Into<String>) -> Self {
        self.tombstone_column = Some(Some(column.into()));
        self
    }

    /// Treat every fetched row as live.
    pub fn without_tombstone(mut self) -> Self {
        self.tombstone_column = Some(None);
        self
    }
}

/// One decoded row of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub watermark: Watermark,
    pub value: T,
    /// Tombstone flag; a NULL tombstone counts as live.
    pub deleted: bool,
    /// Raw row-key column value, when the type has a row key.
    pub row_key: Option<Value>,
}

/// Issues `SELECT .. WHERE w > :since ORDER BY w ASC LIMIT :n` against one table.
///
/// Everything that can be checked without I/O (arguments, schema resolution,
/// watermark column) is checked in [`BatchReader::new`]. The reader holds no
/// cursor; [`read_next_batch`](Self::read_next_batch) is a pure function of
/// its argument and the source contents.
pub struct BatchReader<T> {
    source: Arc<dyn Source>,
    schema: Arc<TypeSchema>,
    table: String,
    watermark_column: String,
    codec: WatermarkCodec,
    tombstone_column: Option<String>,
    bound: WatermarkBound,
    batch_size: usize,
    fetch_timeout: Duration,
    sql: String,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> BatchReader<T> {
    pub fn new(
        source: Arc<dyn Source>,
        registry: &SchemaRegistry,
        config: &ReplicaConfig,
        options: TableOptions,
    ) -> ReplicaResult<Self> {
        config.validate()?;
        if let Some(table) = &options.table {
            if table.trim().is_empty() {
                return Err(ReplicaError::invalid_argument("table", "must not be empty"));
            }
        }

        let schema = registry.resolve::<T>()?;
        let table = options
            .table
            .unwrap_or_else(|| schema.table().to_string());

        let (watermark_column, codec) = match options.watermark {
            Some(WatermarkMode::RowKey) => {
                (schema.row_key()?.column.clone(), WatermarkCodec::Integer)
            }
            Some(WatermarkMode::VersionColumn { column, codec }) => (column, codec),
            None => match &config.watermark {
                WatermarkMode::RowKey => {
                    (schema.row_key()?.column.clone(), WatermarkCodec::Integer)
                }
                WatermarkMode::VersionColumn { column, codec } => (
                    schema.version_column().unwrap_or(column.as_str()).to_string(),
                    *codec,
                ),
            },
        };
        if watermark_column.trim().is_empty() {
            return Err(ReplicaError::invalid_argument(
                "version_column",
                "required when the watermark is a version column",
            ));
        }

        let tombstone_column = match options.tombstone_column {
            Some(column) => column,
            None => schema
                .tombstone_column()
                .map(str::to_string)
                .or_else(|| config.tombstone_column.clone()),
        };

        if config.watermark_bound == WatermarkBound::Inclusive {
            // Duplicates at the cursor are recognised by row key.
            schema.row_key()?;
        }

        let columns = select_columns(&schema, &watermark_column, tombstone_column.as_deref());
        let since_kind = if codec.is_bytes() {
            ParamKind::Bytes
        } else {
            ParamKind::Integer
        };
        let sql = source.dialect().batch_query(
            &columns,
            &table,
            &watermark_column,
            config.watermark_bound.operator(),
            since_kind,
        );
        tracing::debug!(
            "Prepared batch query for {}: {}",
            sanitize_identifier(&table),
            sql
        );

        Ok(Self {
            source,
            schema,
            table,
            watermark_column,
            codec,
            tombstone_column,
            bound: config.watermark_bound,
            batch_size: config.batch_size,
            fetch_timeout: config.fetch_timeout,
            sql,
            _entity: PhantomData,
        })
    }

    /// Fetch up to `batch_size` records with a watermark beyond `since`,
    /// in ascending watermark order.
    pub async fn read_next_batch(&self, since: Watermark) -> ReplicaResult<Vec<Record<T>>> {
        self.read_batch(since, self.batch_size).await
    }

    /// Like [`read_next_batch`](Self::read_next_batch) with an explicit row limit.
    pub async fn read_batch(&self, since: Watermark, limit: usize) -> ReplicaResult<Vec<Record<T>>> {
        let limit = i64::try_from(limit).map_err(|_| {
            ReplicaError::invalid_argument("batch_size", format!("must not exceed {}", i64::MAX))
        })?;
        let query = BatchQuery {
            sql: self.sql.clone(),
            params: vec![self.codec.encode(since)?, Value::Integer(limit)],
            table: self.table.clone(),
        };
        let rows = self.source.fetch(&query, self.fetch_timeout).await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut previous = since;
        for row in &rows {
            let record = self.decode(row)?;
            let out_of_range = match self.bound {
                WatermarkBound::Exclusive => record.watermark <= since,
                WatermarkBound::Inclusive => record.watermark < since,
            };
            if out_of_range || record.watermark < previous {
                return Err(ReplicaError::Watermark(format!(
                    "{} returned watermark {} out of order (since {}, previous {})",
                    self.table, record.watermark, since, previous
                )));
            }
            previous = record.watermark;
            records.push(record);
        }
        Ok(records)
    }

    fn decode(&self, row: &Row) -> ReplicaResult<Record<T>> {
        let raw = row.get(&self.watermark_column).ok_or_else(|| {
            ReplicaError::mapping(
                &self.table,
                &self.watermark_column,
                "watermark column missing from fetched row",
            )
        })?;
        let watermark = self.codec.decode(raw)?;

        let mapped = MappedRow::new(row, &self.schema, &self.table);
        let deleted = match &self.tombstone_column {
            Some(column) => mapped.column::<Option<bool>>(column)?.unwrap_or(false),
            None => false,
        };
        let row_key = match self.schema.row_key() {
            Ok(binding) => Some(mapped.raw(&binding.column)?.clone()),
            Err(_) => None,
        };
        let value = T::from_row(&mapped)?;

        Ok(Record {
            watermark,
            value,
            deleted,
            row_key,
        })
    }

    /// Table identifier as issued to the source.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn watermark_column(&self) -> &str {
        &self.watermark_column
    }

    pub fn tombstone_column(&self) -> Option<&str> {
        self.tombstone_column.as_deref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn bound(&self) -> WatermarkBound {
        self.bound
    }

    pub fn schema(&self) -> &Arc<TypeSchema> {
        &self.schema
    }

    /// Rendered query text.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Bound columns, then the watermark and tombstone columns when not bound.
fn select_columns(schema: &TypeSchema, watermark: &str, tombstone: Option<&str>) -> Vec<String> {
    let mut columns: Vec<String> = schema.bindings().iter().map(|b| b.column.clone()).collect();
    for extra in std::iter::once(watermark).chain(tombstone) {
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(extra)) {
            columns.push(extra.to_string());
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::test_support::{item_config, item_source, Item, Unkeyed};
    use crate::schema::{EntityDescriptor, Field};

    fn reader(config: &ReplicaConfig, options: TableOptions) -> BatchReader<Item> {
        let source = Arc::new(crate::source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        BatchReader::new(source, &SchemaRegistry::new(), config, options).unwrap()
    }

    #[test]
    fn test_query_selects_bound_watermark_and_tombstone_columns() {
        let reader = reader(&item_config(), TableOptions::new());
        assert_eq!(
            reader.sql(),
            "SELECT \"id\", \"name\", \"version\", \"deleted\" FROM \"items\" WHERE \"version\" > ?1 ORDER BY \"version\" ASC LIMIT ?2"
        );
    }

    #[test]
    fn test_row_key_mode_orders_by_key_column() {
        let reader = reader(
            &item_config(),
            TableOptions::new()
                .watermark(WatermarkMode::RowKey)
                .without_tombstone()
                .table("main.items"),
        );
        assert_eq!(reader.watermark_column(), "id");
        assert_eq!(reader.tombstone_column(), None);
        assert_eq!(
            reader.sql(),
            "SELECT \"id\", \"name\" FROM \"main\".\"items\" WHERE \"id\" > ?1 ORDER BY \"id\" ASC LIMIT ?2"
        );
    }

    #[test]
    fn test_inclusive_bound_uses_non_strict_comparison() {
        let config = ReplicaConfig {
            watermark_bound: WatermarkBound::Inclusive,
            ..item_config()
        };
        assert!(reader(&config, TableOptions::new()).sql().contains("\"version\" >= ?1"));
    }

    #[test]
    fn test_invalid_arguments_fail_before_io() {
        let source: Arc<dyn Source> = Arc::new(crate::source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        let registry = SchemaRegistry::new();

        let zero_batch = ReplicaConfig {
            batch_size: 0,
            ..item_config()
        };
        assert!(matches!(
            BatchReader::<Item>::new(Arc::clone(&source), &registry, &zero_batch, TableOptions::new()),
            Err(ReplicaError::InvalidArgument { name: "batch_size", .. })
        ));

        assert!(matches!(
            BatchReader::<Item>::new(source, &registry, &item_config(), TableOptions::new().table(" ")),
            Err(ReplicaError::InvalidArgument { name: "table", .. })
        ));
    }

    #[test]
    fn test_row_key_mode_without_key_fails() {
        let source: Arc<dyn Source> = Arc::new(crate::source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        let result = BatchReader::<Unkeyed>::new(
            source,
            &SchemaRegistry::new(),
            &item_config(),
            TableOptions::new().watermark(WatermarkMode::RowKey),
        );
        assert!(matches!(result, Err(ReplicaError::RowKeyNotSpecified { .. })));
    }

    #[test]
    fn test_descriptor_columns_override_config() {
        struct Versioned;
        impl Entity for Versioned {
            fn describe() -> EntityDescriptor {
                EntityDescriptor::new("Versioned")
                    .field(Field::new("id"))
                    .version_column("rv")
                    .tombstone("gone")
            }
            fn from_row(_row: &MappedRow<'_>) -> ReplicaResult<Self> {
                Ok(Versioned)
            }
            fn member(&self, _name: &str) -> Option<Value> {
                None
            }
        }

        let source: Arc<dyn Source> = Arc::new(crate::source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        let reader = BatchReader::<Versioned>::new(
            source,
            &SchemaRegistry::new(),
            &item_config(),
            TableOptions::new(),
        )
        .unwrap();
        assert_eq!(reader.watermark_column(), "rv");
        assert_eq!(reader.tombstone_column(), Some("gone"));
        assert_eq!(reader.table(), "Versioned");
    }

    #[tokio::test]
    async fn test_read_next_batch_is_bounded_and_ascending() {
        let source = item_source().await;
        source
            .execute_batch(
                "INSERT INTO items (id, name, version, deleted) VALUES
                   (1, 'a', 30, 0), (2, 'b', 10, 0), (3, 'c', 20, 1), (4, 'd', 40, NULL);",
            )
            .await
            .unwrap();
        let config = ReplicaConfig {
            batch_size: 3,
            ..item_config()
        };
        let reader =
            BatchReader::<Item>::new(Arc::new(source), &SchemaRegistry::new(), &config, TableOptions::new())
                .unwrap();

        let first = reader.read_next_batch(Watermark::ZERO).await.unwrap();
        let marks: Vec<u64> = first.iter().map(|r| r.watermark.get()).collect();
        assert_eq!(marks, vec![10, 20, 30]);
        assert!(first[1].deleted);
        assert_eq!(first[0].value.name, "b");
        assert_eq!(first[0].row_key, Some(Value::Integer(2)));

        // Same cursor, same answer.
        assert_eq!(reader.read_next_batch(Watermark::ZERO).await.unwrap(), first);

        let second = reader.read_next_batch(Watermark::new(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(!second[0].deleted, "NULL tombstone counts as live");

        assert!(reader.read_next_batch(Watermark::new(40)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_column_surfaces_as_source_error() {
        let source = crate::source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        );
        source
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, version INTEGER, deleted INTEGER);
                 INSERT INTO items VALUES (1, 1, 0);",
            )
            .await
            .unwrap();
        let reader = BatchReader::<Item>::new(
            Arc::new(source),
            &SchemaRegistry::new(),
            &item_config(),
            TableOptions::new(),
        )
        .unwrap();

        // The query names the missing column, so SQLite rejects it.
        let err = reader.read_next_batch(Watermark::ZERO).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("Failed to read batch from items"));
    }

    #[tokio::test]
    async fn test_mistyped_column_is_mapping_error() {
        let source = item_source().await;
        source
            .execute_batch("INSERT INTO items (id, name, version) VALUES (1, x'00ff', 1);")
            .await
            .unwrap();
        let reader = BatchReader::<Item>::new(
            Arc::new(source),
            &SchemaRegistry::new(),
            &item_config(),
            TableOptions::new(),
        )
        .unwrap();

        match reader.read_next_batch(Watermark::ZERO).await {
            Err(ReplicaError::Mapping { table, column, .. }) => {
                assert_eq!(table, "items");
                assert_eq!(column, "name");
            }
            other => panic!("expected mapping error, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_select_columns_skips_already_bound() {
        let schema = TypeSchema::resolve(
            EntityDescriptor::new("T")
                .field(Field::new("id"))
                .field(Field::new("version")),
        )
        .unwrap();
        assert_eq!(
            select_columns(&schema, "Version", Some("deleted")),
            vec!["id", "version", "deleted"]
        );
    }
}
