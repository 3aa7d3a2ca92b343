// ABOUTME: ContinuousReader - polling loop turning batches into change notifications
// ABOUTME: Tracks the watermark cursor, fires initial sync once, and applies the failure policy

use super::listener::{Change, ChangeListener, ChannelListener, FnListener};
use super::reader::{BatchReader, Record};
use super::signal::{InitialSync, SyncTrigger};
use crate::config::{FailurePolicy, ReplicaConfig, WatermarkBound};
use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::Entity;
use crate::utils::{sleep_or_cancel, Backoff};
use crate::value::Value;
use crate::watermark::Watermark;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback for errors raised after the initial sync already completed.
pub type ErrorCallback = Arc<dyn Fn(&ReplicaError) + Send + Sync>;

/// Lifecycle of a [`ContinuousReader`]. There is no way back to `Idle`.
#[derive(Debug, Clone)]
pub enum ReaderState {
    Idle,
    Polling,
    /// Cancelled.
    Stopped,
    Failed(ReplicaError),
}

impl ReaderState {
    pub fn is_running(&self) -> bool {
        matches!(self, ReaderState::Polling)
    }
}

/// Point-in-time view of a reader's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    pub table: String,
    pub cursor: Watermark,
    pub batches: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
    pub initial_sync_done: bool,
}

struct Shared {
    state: RwLock<ReaderState>,
    progress: RwLock<SyncProgress>,
}

/// Everything the loop takes ownership of at `start`.
struct Pending<T> {
    reader: BatchReader<T>,
    listeners: Vec<Arc<dyn ChangeListener<T>>>,
    trigger: SyncTrigger,
    on_error: Option<ErrorCallback>,
}

/// Drives a [`BatchReader`] in a background task.
///
/// Non-empty batches are dispatched to every listener in ascending watermark
/// order, after which the cursor moves to the batch's highest watermark and
/// the next fetch starts immediately. The first empty poll resolves the
/// [`InitialSync`] signal; empty polls then sleep for the poll delay.
///
/// Listeners are registered before [`start`](Self::start). Each listener sees
/// a whole batch before the next fetch begins.
pub struct ContinuousReader<T> {
    table: String,
    poll_delay: Duration,
    policy: FailurePolicy,
    pending: Mutex<Option<Pending<T>>>,
    shared: Arc<Shared>,
    signal: InitialSync,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Entity> ContinuousReader<T> {
    pub fn new(reader: BatchReader<T>, config: &ReplicaConfig) -> ReplicaResult<Self> {
        config.validate()?;
        let table = reader.table().to_string();
        let (trigger, signal) = SyncTrigger::new(&table);
        let shared = Arc::new(Shared {
            state: RwLock::new(ReaderState::Idle),
            progress: RwLock::new(SyncProgress {
                table: table.clone(),
                ..Default::default()
            }),
        });

        Ok(Self {
            table,
            poll_delay: config.poll_delay,
            policy: config.failure_policy.clone(),
            pending: Mutex::new(Some(Pending {
                reader,
                listeners: Vec::new(),
                trigger,
                on_error: None,
            })),
            shared,
            signal,
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// Register a listener. Fails once the reader has been started.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener<T>>) -> ReplicaResult<()> {
        let mut pending = self.pending.lock();
        let pending = pending
            .as_mut()
            .ok_or_else(|| ReplicaError::AlreadyStarted(self.table.clone()))?;
        pending.listeners.push(listener);
        Ok(())
    }

    pub fn on_upsert<F>(&self, f: F) -> ReplicaResult<()>
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(FnListener::upserts(f)))
    }

    pub fn on_delete<F>(&self, f: F) -> ReplicaResult<()>
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(FnListener::deletes(f)))
    }

    /// Receive every change on a channel.
    pub fn subscribe(&self) -> ReplicaResult<mpsc::UnboundedReceiver<Change<T>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(Arc::new(ChannelListener::new(tx)))?;
        Ok(rx)
    }

    /// Set the callback for failures that happen after the initial sync.
    pub fn on_error(&self, callback: ErrorCallback) -> ReplicaResult<()> {
        let mut pending = self.pending.lock();
        let pending = pending
            .as_mut()
            .ok_or_else(|| ReplicaError::AlreadyStarted(self.table.clone()))?;
        pending.on_error = Some(callback);
        Ok(())
    }

    /// Spawn the polling loop. The loop stops when `cancel` (or
    /// [`shutdown`](Self::shutdown)) fires.
    pub fn start(&self, cancel: CancellationToken) -> ReplicaResult<()> {
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| ReplicaError::AlreadyStarted(self.table.clone()))?;

        let cancel = cancel.child_token();
        *self.shared.state.write() = ReaderState::Polling;
        tracing::info!(
            "Starting reader for {} ({} listener(s), batch size {})",
            self.table,
            pending.listeners.len(),
            pending.reader.batch_size()
        );

        let seen_at_cursor = match pending.reader.bound() {
            WatermarkBound::Exclusive => None,
            WatermarkBound::Inclusive => Some(HashSet::new()),
        };
        let poll = PollLoop {
            reader: pending.reader,
            listeners: pending.listeners,
            trigger: pending.trigger,
            on_error: pending.on_error,
            shared: Arc::clone(&self.shared),
            poll_delay: self.poll_delay,
            policy: self.policy.clone(),
            cursor: Watermark::ZERO,
            seen_at_cursor,
        };
        let handle = tokio::spawn(poll.run(cancel.clone()));

        *self.cancel.lock() = Some(cancel);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Reader task for {} ended abnormally: {}", self.table, e);
            }
        }
    }

    /// Handle to the one-shot initial-sync signal; available before `start`.
    pub fn when_initial_read_finished(&self) -> InitialSync {
        self.signal.clone()
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state.read().clone()
    }

    pub fn progress(&self) -> SyncProgress {
        self.shared.progress.read().clone()
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl<T> Drop for ContinuousReader<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().as_ref() {
            cancel.cancel();
        }
    }
}

struct PollLoop<T> {
    reader: BatchReader<T>,
    listeners: Vec<Arc<dyn ChangeListener<T>>>,
    trigger: SyncTrigger,
    on_error: Option<ErrorCallback>,
    shared: Arc<Shared>,
    poll_delay: Duration,
    policy: FailurePolicy,
    cursor: Watermark,
    /// Row keys already dispatched at `cursor` (inclusive bound only).
    seen_at_cursor: Option<HashSet<String>>,
}

impl<T: Entity> PollLoop<T> {
    async fn run(mut self, cancel: CancellationToken) {
        let table = self.reader.table().to_string();
        match self.poll(&cancel).await {
            Ok(()) => {
                *self.shared.state.write() = ReaderState::Stopped;
                self.trigger.cancel();
                tracing::info!("Reader for {} stopped at watermark {}", table, self.cursor);
            }
            Err(err) => {
                tracing::error!(
                    "Reader for {} failed at watermark {}: {:?}",
                    table,
                    self.cursor,
                    err
                );
                *self.shared.state.write() = ReaderState::Failed(err.clone());
                if !self.trigger.fail(err.clone()) {
                    if let Some(callback) = &self.on_error {
                        callback(&err);
                    }
                }
            }
        }
    }

    /// Runs until cancelled (`Ok`) or failed (`Err`).
    async fn poll(&mut self, cancel: &CancellationToken) -> ReplicaResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let Some(batch) = self.fetch(cancel).await? else {
                return Ok(());
            };
            let fetched = batch.len();
            let fresh = self.skip_seen(batch)?;

            if fresh.is_empty() {
                if self.trigger.complete() {
                    let mut progress = self.shared.progress.write();
                    progress.initial_sync_done = true;
                    tracing::info!(
                        "Initial sync of {} complete: {} upserts, {} deletes, watermark {}",
                        self.reader.table(),
                        progress.upserts,
                        progress.deletes,
                        self.cursor
                    );
                } else if fetched == 0 {
                    tracing::trace!("No changes on {}", self.reader.table());
                }
                if !sleep_or_cancel(self.poll_delay, cancel).await {
                    return Ok(());
                }
                continue;
            }

            self.dispatch(fresh)?;
        }
    }

    /// One batch read, retried per the failure policy. `None` on cancellation.
    async fn fetch(&self, cancel: &CancellationToken) -> ReplicaResult<Option<Vec<Record<T>>>> {
        let mut backoff = match &self.policy {
            FailurePolicy::FailFast => None,
            FailurePolicy::RetryWithBackoff {
                max_retries,
                initial_delay,
                max_delay,
            } => Some(Backoff::new(*max_retries, *initial_delay, *max_delay)),
        };

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.reader.read_batch(self.cursor, self.fetch_limit()) => result,
            };

            match result {
                Ok(batch) => return Ok(Some(batch)),
                Err(err) if err.is_transient() => {
                    let Some(delay) = backoff.as_mut().and_then(Iterator::next) else {
                        return Err(err);
                    };
                    tracing::warn!(
                        "Batch read from {} failed, retrying in {:?} ({} retries left): {}",
                        self.reader.table(),
                        delay,
                        backoff.as_ref().map_or(0, Backoff::remaining),
                        err
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Rows to request. Under the inclusive bound the rows already dispatched
    /// at the cursor come back too, so the page is widened by that many.
    fn fetch_limit(&self) -> usize {
        let seen = self.seen_at_cursor.as_ref().map_or(0, HashSet::len);
        self.reader.batch_size().saturating_add(seen)
    }

    /// Drop rows re-read at the cursor under the inclusive bound.
    ///
    /// A short page of repeats means the source has nothing new. A full page
    /// of repeats is only possible when rows at the cursor share a row key.
    fn skip_seen(&self, batch: Vec<Record<T>>) -> ReplicaResult<Vec<Record<T>>> {
        let Some(seen) = &self.seen_at_cursor else {
            return Ok(batch);
        };
        let limit = self.fetch_limit();
        let fetched = batch.len();
        let fresh: Vec<_> = batch
            .into_iter()
            .filter(|record| {
                record.watermark != self.cursor
                    || !record
                        .row_key
                        .as_ref()
                        .is_some_and(|key| seen.contains(&key_repr(key)))
            })
            .collect();

        if fresh.is_empty() && fetched >= limit {
            return Err(ReplicaError::WatermarkStall {
                table: self.reader.table().to_string(),
                watermark: self.cursor.get(),
                batch_size: limit,
            });
        }
        Ok(fresh)
    }

    fn dispatch(&mut self, records: Vec<Record<T>>) -> ReplicaResult<()> {
        let from = self.cursor;
        let high = records
            .iter()
            .map(|r| r.watermark)
            .max()
            .unwrap_or(self.cursor);

        if let Some(seen) = self.seen_at_cursor.as_mut() {
            if high != self.cursor {
                seen.clear();
            }
            seen.extend(
                records
                    .iter()
                    .filter(|r| r.watermark == high)
                    .filter_map(|r| r.row_key.as_ref().map(key_repr)),
            );
        }

        let mut upserts = 0u64;
        let mut deletes = 0u64;
        let changes: Vec<Change<T>> = records
            .into_iter()
            .map(|record| {
                let value = Arc::new(record.value);
                if record.deleted {
                    deletes += 1;
                    Change::Delete {
                        watermark: record.watermark,
                        value,
                    }
                } else {
                    upserts += 1;
                    Change::Upsert {
                        watermark: record.watermark,
                        value,
                    }
                }
            })
            .collect();

        for listener in &self.listeners {
            listener.on_batch(&changes)?;
        }

        self.cursor = high;
        {
            let mut progress = self.shared.progress.write();
            progress.cursor = high;
            progress.batches += 1;
            progress.upserts += upserts;
            progress.deletes += deletes;
            progress.last_batch_at = Some(Utc::now());
        }
        tracing::debug!(
            "Applied {} change(s) to {}: watermark {} -> {}",
            changes.len(),
            self.reader.table(),
            from,
            high
        );
        Ok(())
    }
}

fn key_repr(value: &Value) -> String {
    format!("{}:{}", value.kind(), value)
}
