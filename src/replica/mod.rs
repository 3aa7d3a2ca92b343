// ABOUTME: Incremental replication engine: batch reads, polling loop, replica stores
// ABOUTME: Data flows BatchReader -> ContinuousReader -> listeners such as ReplicaStore

pub mod continuous;
pub mod listener;
pub mod reader;
pub mod set;
pub mod signal;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use continuous::{ContinuousReader, ErrorCallback, ReaderState, SyncProgress};
pub use listener::{Change, ChangeListener};
pub use reader::{BatchReader, Record, TableOptions};
pub use set::{ManagedTable, ReplicaSet};
pub use signal::{InitialSync, SyncStatus};
pub use store::{row_key_fn, KeyFn, ReplicaStore, Table};
