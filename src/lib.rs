// ABOUTME: Library root for memreplica - in-process replicas of SQL tables
// ABOUTME: Exports the schema layer, sources, and the incremental replication engine

//! Keeps in-memory, continuously refreshed copies of source tables.
//!
//! A [`ContinuousReader`] polls a [`Source`] for rows whose watermark
//! (a version counter or an increasing key) is beyond its cursor, dispatches
//! them as upserts and deletes, and resolves an [`InitialSync`] signal the
//! first time the source has nothing newer. [`Table`] and [`ReplicaSet`]
//! wire readers to concurrently readable [`ReplicaStore`]s.

pub mod config;
pub mod error;
pub mod replica;
pub mod schema;
pub mod source;
pub mod utils;
pub mod value;
pub mod watermark;

pub use config::{FailurePolicy, ReplicaConfig, WatermarkBound, WatermarkMode};
pub use error::{ReplicaError, ReplicaResult};
pub use replica::{
    BatchReader, Change, ChangeListener, ContinuousReader, ErrorCallback, InitialSync, KeyFn,
    ReaderState, Record, ReplicaSet, ReplicaStore, SyncProgress, SyncStatus, Table, TableOptions,
};
pub use schema::{Entity, EntityDescriptor, Field, MappedRow, SchemaRegistry, TypeSchema};
pub use source::{BatchQuery, PostgresSource, Source, SqlDialect, SqliteSource};
pub use value::{FromValue, Row, Value};
pub use watermark::{Watermark, WatermarkCodec};
