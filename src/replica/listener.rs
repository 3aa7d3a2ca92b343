// ABOUTME: Change notifications dispatched by a ContinuousReader
// ABOUTME: Listener trait plus closure and channel adapters for fan-out at registration

use crate::error::ReplicaResult;
use crate::watermark::Watermark;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One dispatched row change.
#[derive(Debug)]
pub enum Change<T> {
    Upsert { watermark: Watermark, value: Arc<T> },
    /// The row's tombstone was set. `value` is the row as last read.
    Delete { watermark: Watermark, value: Arc<T> },
}

impl<T> Clone for Change<T> {
    fn clone(&self) -> Self {
        match self {
            Change::Upsert { watermark, value } => Change::Upsert {
                watermark: *watermark,
                value: Arc::clone(value),
            },
            Change::Delete { watermark, value } => Change::Delete {
                watermark: *watermark,
                value: Arc::clone(value),
            },
        }
    }
}

impl<T> Change<T> {
    pub fn watermark(&self) -> Watermark {
        match self {
            Change::Upsert { watermark, .. } | Change::Delete { watermark, .. } => *watermark,
        }
    }

    pub fn value(&self) -> &Arc<T> {
        match self {
            Change::Upsert { value, .. } | Change::Delete { value, .. } => value,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}

/// Receives changes from a reader's polling loop, in ascending watermark order.
///
/// Called on the loop's task; a slow listener delays the next fetch. An error
/// stops the reader as a dispatch failure.
pub trait ChangeListener<T>: Send + Sync {
    fn on_change(&self, change: &Change<T>) -> ReplicaResult<()>;

    /// A whole batch. Override to apply it atomically.
    fn on_batch(&self, changes: &[Change<T>]) -> ReplicaResult<()> {
        for change in changes {
            self.on_change(change)?;
        }
        Ok(())
    }
}

/// Adapter for `on_upsert` / `on_delete` closures.
pub(crate) struct FnListener<F> {
    deletes: bool,
    f: F,
}

impl<F> FnListener<F> {
    pub(crate) fn upserts(f: F) -> Self {
        Self { deletes: false, f }
    }

    pub(crate) fn deletes(f: F) -> Self {
        Self { deletes: true, f }
    }
}

impl<T, F> ChangeListener<T> for FnListener<F>
where
    F: Fn(&Arc<T>) + Send + Sync,
{
    fn on_change(&self, change: &Change<T>) -> ReplicaResult<()> {
        if change.is_delete() == self.deletes {
            (self.f)(change.value());
        }
        Ok(())
    }
}

/// Forwards changes to an unbounded channel; a dropped receiver unsubscribes.
pub(crate) struct ChannelListener<T> {
    tx: mpsc::UnboundedSender<Change<T>>,
}

impl<T> ChannelListener<T> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Change<T>>) -> Self {
        Self { tx }
    }
}

impl<T: Send + Sync> ChangeListener<T> for ChannelListener<T> {
    fn on_change(&self, change: &Change<T>) -> ReplicaResult<()> {
        // Closed means the subscriber went away.
        let _ = self.tx.send(change.clone());
        Ok(())
    }
}
