// ABOUTME: ReplicaSet - several tables replicated from one shared source
// ABOUTME: Starts every table together and waits on the conjunction of their initial syncs

use super::continuous::{ErrorCallback, SyncProgress};
use super::reader::TableOptions;
use super::signal::InitialSync;
use super::store::{KeyFn, ReplicaStore, Table};
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{Entity, SchemaRegistry};
use crate::source::Source;
use crate::value::FromValue;
use futures::future::{join_all, try_join_all};
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type-erased view of a [`Table`] held by a [`ReplicaSet`].
#[async_trait::async_trait]
pub trait ManagedTable: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self, cancel: CancellationToken) -> ReplicaResult<()>;
    fn initial_sync(&self) -> InitialSync;
    fn progress(&self) -> SyncProgress;
    async fn shutdown(&self);
}

#[async_trait::async_trait]
impl<K, T> ManagedTable for Table<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Entity,
{
    fn name(&self) -> &str {
        Table::name(self)
    }

    fn start(&self, cancel: CancellationToken) -> ReplicaResult<()> {
        Table::start(self, cancel)
    }

    fn initial_sync(&self) -> InitialSync {
        self.when_initial_read_finished()
    }

    fn progress(&self) -> SyncProgress {
        Table::progress(self)
    }

    async fn shutdown(&self) {
        Table::shutdown(self).await
    }
}

/// Tables sharing one source, one configuration and one schema registry.
///
/// ```no_run
/// # use memreplica::{ReplicaConfig, ReplicaSet, SqliteSource, TableOptions};
/// # use memreplica::{Entity, EntityDescriptor, Field, MappedRow, ReplicaResult, Value};
/// # use std::sync::Arc;
/// # use tokio_util::sync::CancellationToken;
/// # struct User { id: i64 }
/// # impl Entity for User {
/// #     fn describe() -> EntityDescriptor { EntityDescriptor::new("User").field(Field::new("id")) }
/// #     fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self> { Ok(User { id: row.get("id")? }) }
/// #     fn member(&self, _: &str) -> Option<Value> { Some(self.id.into()) }
/// # }
/// # async fn demo() -> anyhow::Result<()> {
/// let source = SqliteSource::open("app.db")?;
/// let mut set = ReplicaSet::new(Arc::new(source), ReplicaConfig::default())?;
/// let users = set.table::<i64, User>(TableOptions::new())?;
/// set.init(CancellationToken::new()).await?;
/// println!("{} users", users.len());
/// # Ok(())
/// # }
/// ```
pub struct ReplicaSet {
    source: Arc<dyn Source>,
    config: ReplicaConfig,
    registry: Arc<SchemaRegistry>,
    on_error: Option<ErrorCallback>,
    tables: Vec<Box<dyn ManagedTable>>,
}

impl ReplicaSet {
    pub fn new(source: Arc<dyn Source>, config: ReplicaConfig) -> ReplicaResult<Self> {
        Self::with_registry(source, config, Arc::new(SchemaRegistry::new()))
    }

    /// Share a schema registry with other sets.
    pub fn with_registry(
        source: Arc<dyn Source>,
        config: ReplicaConfig,
        registry: Arc<SchemaRegistry>,
    ) -> ReplicaResult<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            registry,
            on_error: None,
            tables: Vec::new(),
        })
    }

    /// Error callback given to every table added afterwards.
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Add a table keyed by `T`'s row key and return its store.
    pub fn table<K, T>(&mut self, options: TableOptions) -> ReplicaResult<ReplicaStore<K, T>>
    where
        K: Eq + Hash + Clone + Send + Sync + FromValue + 'static,
        T: Entity,
    {
        let table = Table::<K, T>::new(
            Arc::clone(&self.source),
            &self.registry,
            &self.config,
            options,
        )?;
        self.register(table)
    }

    /// Add a table keyed by `key_fn` and return its store.
    pub fn table_with_key_fn<K, T>(
        &mut self,
        options: TableOptions,
        key_fn: KeyFn<K, T>,
    ) -> ReplicaResult<ReplicaStore<K, T>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        T: Entity,
    {
        let table = Table::<K, T>::with_key_fn(
            Arc::clone(&self.source),
            &self.registry,
            &self.config,
            options,
            key_fn,
        )?;
        self.register(table)
    }

    fn register<K, T>(&mut self, table: Table<K, T>) -> ReplicaResult<ReplicaStore<K, T>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        T: Entity,
    {
        if let Some(callback) = &self.on_error {
            table.on_error(Arc::clone(callback))?;
        }
        let store = table.store();
        self.tables.push(Box::new(table));
        Ok(store)
    }

    /// Start every table and wait until all have finished their initial read.
    ///
    /// Fails with the first table failure. Tables that were started keep
    /// running until `cancel` fires or the set is dropped.
    pub async fn init(&self, cancel: CancellationToken) -> ReplicaResult<()> {
        if self.tables.is_empty() {
            return Err(ReplicaError::invalid_argument(
                "tables",
                "replica set has no tables",
            ));
        }
        tracing::info!("Starting {} replicated table(s)", self.tables.len());
        for table in &self.tables {
            table.start(cancel.clone())?;
        }

        let signals: Vec<InitialSync> = self.tables.iter().map(|t| t.initial_sync()).collect();
        try_join_all(signals.iter().map(|signal| signal.wait())).await?;

        let rows: u64 = self.tables.iter().map(|t| t.progress().upserts).sum();
        tracing::info!(
            "All {} table(s) completed initial sync ({} upserts)",
            self.tables.len(),
            rows
        );
        Ok(())
    }

    /// Cancel every table and wait for their loops to exit.
    pub async fn shutdown(&self) {
        join_all(self.tables.iter().map(|t| t.shutdown())).await;
    }

    pub fn progress(&self) -> Vec<SyncProgress> {
        self.tables.iter().map(|t| t.progress()).collect()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }
}
