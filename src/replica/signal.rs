// ABOUTME: One-shot initial-sync signal shared by any number of waiters
// ABOUTME: Backed by a tokio watch channel; the first resolution wins

use crate::error::{ReplicaError, ReplicaResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Resolution of a reader's initial read.
#[derive(Debug, Clone)]
pub enum SyncStatus {
    Pending,
    /// A poll returned no rows: the replica holds everything the source had.
    Ready,
    Failed(ReplicaError),
    /// The reader was cancelled before its first empty poll.
    Cancelled,
}

impl SyncStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Pending)
    }
}

/// Waitable handle to a reader's initial-sync signal.
///
/// Cheap to clone; every clone observes the same single resolution.
#[derive(Debug, Clone)]
pub struct InitialSync {
    rx: watch::Receiver<SyncStatus>,
    table: String,
}

impl InitialSync {
    /// Wait until the signal resolves.
    ///
    /// Returns immediately when it already has. Fails with the reader's error,
    /// with [`ReplicaError::Cancelled`] when the reader was cancelled first, or
    /// with [`ReplicaError::ReaderStopped`] when the reader was dropped
    /// without resolving it.
    pub async fn wait(&self) -> ReplicaResult<()> {
        let mut rx = self.rx.clone();
        let status = match rx.wait_for(|status| !status.is_pending()).await {
            Ok(status) => status.clone(),
            Err(_) => return Err(ReplicaError::ReaderStopped(self.table.clone())),
        };
        self.into_result(status)
    }

    /// Like [`wait`](Self::wait), giving up with [`ReplicaError::Cancelled`]
    /// when `cancel` fires first. The reader itself is unaffected.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> ReplicaResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReplicaError::Cancelled(self.table.clone())),
            result = self.wait() => result,
        }
    }

    /// Current status without waiting.
    pub fn status(&self) -> SyncStatus {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.rx.borrow(), SyncStatus::Ready)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn into_result(&self, status: SyncStatus) -> ReplicaResult<()> {
        match status {
            SyncStatus::Ready => Ok(()),
            SyncStatus::Failed(err) => Err(err),
            SyncStatus::Cancelled => Err(ReplicaError::Cancelled(self.table.clone())),
            SyncStatus::Pending => Err(ReplicaError::ReaderStopped(self.table.clone())),
        }
    }
}

/// Resolving side, owned by the polling loop.
#[derive(Debug)]
pub(crate) struct SyncTrigger {
    tx: watch::Sender<SyncStatus>,
}

impl SyncTrigger {
    pub(crate) fn new(table: &str) -> (Self, InitialSync) {
        let (tx, rx) = watch::channel(SyncStatus::Pending);
        (
            Self { tx },
            InitialSync {
                rx,
                table: table.to_string(),
            },
        )
    }

    /// Resolve as ready. Returns `false` if already resolved.
    pub(crate) fn complete(&self) -> bool {
        self.resolve(SyncStatus::Ready)
    }

    pub(crate) fn fail(&self, err: ReplicaError) -> bool {
        self.resolve(SyncStatus::Failed(err))
    }

    pub(crate) fn cancel(&self) -> bool {
        self.resolve(SyncStatus::Cancelled)
    }

    fn resolve(&self, outcome: SyncStatus) -> bool {
        self.tx.send_if_modified(|status| {
            if status.is_pending() {
                *status = outcome;
                true
            } else {
                false
            }
        })
    }
}
