// ABOUTME: ReplicaStore - concurrently readable keyed mirror of one source table
// ABOUTME: Table pairs a ContinuousReader with the store its changes are applied to

use super::continuous::{ContinuousReader, ErrorCallback, SyncProgress};
use super::listener::{Change, ChangeListener};
use super::reader::{BatchReader, TableOptions};
use super::signal::InitialSync;
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{Entity, SchemaRegistry, TypeSchema};
use crate::source::Source;
use crate::value::FromValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Derives the application key of a replicated value.
pub type KeyFn<K, T> = Arc<dyn Fn(&T) -> ReplicaResult<K> + Send + Sync>;

/// Read-only handle to a replicated table.
///
/// Clones share the same map. Only the owning reader's loop writes to it, one
/// whole batch per write lock, so readers never see half of a batch.
pub struct ReplicaStore<K, V> {
    entries: Arc<RwLock<HashMap<K, Arc<V>>>>,
}

impl<K, V> Clone for ReplicaStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K: Eq + Hash + Clone, V> ReplicaStore<K, V> {
    fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }

    /// Consistent copy of every entry.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

/// Listener applying changes to the store.
struct StoreWriter<K, T> {
    store: ReplicaStore<K, T>,
    key_fn: KeyFn<K, T>,
}

impl<K, T> ChangeListener<T> for StoreWriter<K, T>
where
    K: Eq + Hash + Clone + Send + Sync,
    T: Send + Sync,
{
    fn on_change(&self, change: &Change<T>) -> ReplicaResult<()> {
        self.on_batch(std::slice::from_ref(change))
    }

    fn on_batch(&self, changes: &[Change<T>]) -> ReplicaResult<()> {
        // Keys first so a failing key function leaves the store untouched.
        let keyed = changes
            .iter()
            .map(|change| Ok(((self.key_fn)(change.value().as_ref())?, change)))
            .collect::<ReplicaResult<Vec<_>>>()?;

        let mut entries = self.store.entries.write();
        for (key, change) in keyed {
            match change {
                Change::Upsert { value, .. } => {
                    entries.insert(key, Arc::clone(value));
                }
                Change::Delete { .. } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Key function reading the row-key member through [`Entity::member`].
pub fn row_key_fn<K, T>(schema: &TypeSchema) -> ReplicaResult<KeyFn<K, T>>
where
    K: FromValue + 'static,
    T: Entity,
{
    let member = schema.row_key()?.member.clone();
    let table = schema.table().to_string();
    Ok(Arc::new(move |value: &T| {
        let raw = value.member(&member).ok_or_else(|| {
            ReplicaError::mapping(
                &table,
                &member,
                "row-key member not exposed by Entity::member",
            )
        })?;
        K::from_value(&raw).map_err(|reason| ReplicaError::mapping(&table, &member, reason))
    }))
}

/// A replicated table: a reader plus the store it feeds.
pub struct Table<K, T> {
    reader: ContinuousReader<T>,
    store: ReplicaStore<K, T>,
}

impl<K, T> Table<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Entity,
{
    /// Keyed by the type's row key.
    pub fn new(
        source: Arc<dyn Source>,
        registry: &SchemaRegistry,
        config: &ReplicaConfig,
        options: TableOptions,
    ) -> ReplicaResult<Self>
    where
        K: FromValue,
    {
        let reader = BatchReader::<T>::new(source, registry, config, options)?;
        let key_fn = row_key_fn::<K, T>(reader.schema())?;
        Self::from_reader(reader, config, key_fn)
    }

    /// Keyed by `key_fn`; the type needs no row key unless the watermark or
    /// bound requires one.
    pub fn with_key_fn(
        source: Arc<dyn Source>,
        registry: &SchemaRegistry,
        config: &ReplicaConfig,
        options: TableOptions,
        key_fn: KeyFn<K, T>,
    ) -> ReplicaResult<Self> {
        let reader = BatchReader::<T>::new(source, registry, config, options)?;
        Self::from_reader(reader, config, key_fn)
    }

    fn from_reader(
        reader: BatchReader<T>,
        config: &ReplicaConfig,
        key_fn: KeyFn<K, T>,
    ) -> ReplicaResult<Self> {
        let reader = ContinuousReader::new(reader, config)?;
        let store = ReplicaStore::new();
        reader.add_listener(Arc::new(StoreWriter {
            store: store.clone(),
            key_fn,
        }))?;
        Ok(Self { reader, store })
    }

    pub fn start(&self, cancel: CancellationToken) -> ReplicaResult<()> {
        self.reader.start(cancel)
    }

    pub async fn shutdown(&self) {
        self.reader.shutdown().await
    }

    pub fn store(&self) -> ReplicaStore<K, T> {
        self.store.clone()
    }

    /// The underlying reader, for extra listeners and state.
    pub fn reader(&self) -> &ContinuousReader<T> {
        &self.reader
    }

    pub fn on_error(&self, callback: ErrorCallback) -> ReplicaResult<()> {
        self.reader.on_error(callback)
    }

    pub fn when_initial_read_finished(&self) -> InitialSync {
        self.reader.when_initial_read_finished()
    }

    pub fn progress(&self) -> SyncProgress {
        self.reader.progress()
    }

    pub fn name(&self) -> &str {
        self.reader.table()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        self.store.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }
}
