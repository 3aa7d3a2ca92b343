// ABOUTME: Error taxonomy for the replication engine
// ABOUTME: Argument, schema, mapping and source failures share one cloneable type

use std::sync::Arc;
use thiserror::Error;

/// Result alias used across the engine's public API.
pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

/// Everything that can go wrong while resolving, reading or replicating a table.
///
/// The type is `Clone` because a single failure is handed to every waiter of a
/// reader's initial-sync signal. Transport failures keep their full `anyhow`
/// chain behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    /// Missing or out-of-range construction argument. Raised before any I/O.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// More than one member of a type is designated as the row key.
    #[error("ambiguous row key on type {type_name}: members {members:?} are all marked as row key")]
    AmbiguousRowKey {
        type_name: String,
        members: Vec<String>,
    },

    /// No explicit row key and no conventional `id` member.
    #[error(
        "row key not specified for type {type_name}: mark one field as row key or add an `id` field"
    )]
    RowKeyNotSpecified { type_name: String },

    /// A fetched row does not match the type's schema.
    #[error("failed to map column `{column}` of {table}: {reason}")]
    Mapping {
        table: String,
        column: String,
        reason: String,
    },

    /// A watermark value could not be decoded or encoded.
    #[error("invalid watermark: {0}")]
    Watermark(String),

    /// Transport or execution failure reported by the source.
    #[error("source error: {0:#}")]
    Source(Arc<anyhow::Error>),

    /// Inclusive bound could not make progress: a full page held only row keys
    /// already dispatched at the current watermark, so the key is not unique there.
    #[error(
        "watermark stalled at {watermark} on {table}: all {batch_size} rows fetched at this watermark repeat row keys already applied"
    )]
    WatermarkStall {
        table: String,
        watermark: u64,
        batch_size: usize,
    },

    /// `start` was called on a reader that already left the idle state.
    #[error("reader for {0} was already started")]
    AlreadyStarted(String),

    /// The reader was cancelled before the awaited event happened.
    #[error("reader for {0} was cancelled")]
    Cancelled(String),

    /// The reader went away without ever resolving its signal.
    #[error("reader for {0} stopped before completing its initial read")]
    ReaderStopped(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ReplicaError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        ReplicaError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn mapping(
        table: impl Into<String>,
        column: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ReplicaError::Mapping {
            table: table.into(),
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry from the same cursor could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::Source(_))
    }
}

impl From<anyhow::Error> for ReplicaError {
    fn from(err: anyhow::Error) -> Self {
        ReplicaError::Source(Arc::new(err))
    }
}
