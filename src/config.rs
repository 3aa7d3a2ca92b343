// ABOUTME: Reader configuration: watermark mode, batch sizing, delays, failure policy
// ABOUTME: Validated at construction; loadable from TOML with range checks

use crate::error::{ReplicaError, ReplicaResult};
use crate::watermark::WatermarkCodec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_VERSION_COLUMN: &str = "RowVersion";
pub const DEFAULT_TOMBSTONE_COLUMN: &str = "IsDeleted";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a table's watermark comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkMode {
    /// The resolved row-key column doubles as watermark (identity or
    /// auto-increment keys). Sees inserts only unless keys are reassigned.
    RowKey,
    /// A separate version counter bumped on every write.
    VersionColumn {
        column: String,
        codec: WatermarkCodec,
    },
}

impl Default for WatermarkMode {
    fn default() -> Self {
        WatermarkMode::VersionColumn {
            column: DEFAULT_VERSION_COLUMN.to_string(),
            codec: WatermarkCodec::default(),
        }
    }
}

/// Lower bound used when asking for rows newer than the cursor.
///
/// The cursor advances to the highest watermark of each batch. With
/// `Exclusive`, a batch cut off by the size limit in the middle of a run of
/// equal watermarks would lose the rest of that run, so `Exclusive` requires
/// watermark values to be unique per row (rowversion, identity, sequences).
/// `Inclusive` tolerates duplicates by re-reading the boundary watermark and
/// skipping rows already dispatched there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkBound {
    #[default]
    Exclusive,
    Inclusive,
}

impl WatermarkBound {
    pub(crate) fn operator(&self) -> &'static str {
        match self {
            WatermarkBound::Exclusive => ">",
            WatermarkBound::Inclusive => ">=",
        }
    }
}

/// What a reader does when the source fails.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop on the first source error.
    #[default]
    FailFast,
    /// Retry source errors from the same cursor with doubling delays, then stop.
    RetryWithBackoff {
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

/// Settings shared by the readers of one or more tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub watermark: WatermarkMode,
    pub watermark_bound: WatermarkBound,
    /// Column flagging logically deleted rows; `None` disables delete detection.
    pub tombstone_column: Option<String>,
    /// Per-fetch limit; zero waits indefinitely.
    pub fetch_timeout: Duration,
    pub batch_size: usize,
    /// Sleep between polls that return no rows.
    pub poll_delay: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            watermark: WatermarkMode::default(),
            watermark_bound: WatermarkBound::default(),
            tombstone_column: Some(DEFAULT_TOMBSTONE_COLUMN.to_string()),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_delay: DEFAULT_POLL_DELAY,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl ReplicaConfig {
    /// Check ranges and required names. Called by every reader constructor.
    pub fn validate(&self) -> ReplicaResult<()> {
        if self.batch_size == 0 {
            return Err(ReplicaError::invalid_argument(
                "batch_size",
                "must be greater than zero",
            ));
        }
        if i64::try_from(self.batch_size).is_err() {
            return Err(ReplicaError::invalid_argument(
                "batch_size",
                format!("must not exceed {}", i64::MAX),
            ));
        }
        if self.poll_delay.is_zero() {
            return Err(ReplicaError::invalid_argument(
                "poll_delay",
                "must be greater than zero",
            ));
        }
        if let WatermarkMode::VersionColumn { column, codec } = &self.watermark {
            if column.trim().is_empty() {
                return Err(ReplicaError::invalid_argument(
                    "version_column",
                    "required when the watermark is a version column",
                ));
            }
            if let WatermarkCodec::BigEndianBytes { width } = codec {
                if *width == 0 {
                    return Err(ReplicaError::invalid_argument(
                        "watermark_codec",
                        "byte width must be greater than zero",
                    ));
                }
            }
        }
        if let Some(column) = &self.tombstone_column {
            if column.trim().is_empty() {
                return Err(ReplicaError::invalid_argument(
                    "tombstone_column",
                    "must not be empty; use None to disable delete detection",
                ));
            }
        }
        if let FailurePolicy::RetryWithBackoff {
            initial_delay,
            max_delay,
            ..
        } = &self.failure_policy
        {
            if initial_delay.is_zero() || max_delay < initial_delay {
                return Err(ReplicaError::invalid_argument(
                    "failure_policy",
                    "retry delays must be positive with max_delay >= initial_delay",
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> ReplicaResult<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| ReplicaError::Config(e.to_string()))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub async fn load(path: &Path) -> ReplicaResult<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            ReplicaError::Config(format!("Failed to read config from {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&contents)
    }
}

/// On-disk representation. Signed numbers so that negative values are
/// reported as argument errors instead of parse errors.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    batch_size: i64,
    poll_delay_ms: i64,
    fetch_timeout_secs: i64,
    detect_deletes: bool,
    tombstone_column: String,
    watermark: WatermarkFile,
    retry: RetryFile,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE as i64,
            poll_delay_ms: DEFAULT_POLL_DELAY.as_millis() as i64,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs() as i64,
            detect_deletes: true,
            tombstone_column: DEFAULT_TOMBSTONE_COLUMN.to_string(),
            watermark: WatermarkFile::default(),
            retry: RetryFile::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WatermarkFile {
    mode: ModeFile,
    column: String,
    codec: CodecFile,
    width: usize,
    bound: WatermarkBound,
}

impl Default for WatermarkFile {
    fn default() -> Self {
        Self {
            mode: ModeFile::VersionColumn,
            column: DEFAULT_VERSION_COLUMN.to_string(),
            codec: CodecFile::BigEndianBytes,
            width: 8,
            bound: WatermarkBound::Exclusive,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ModeFile {
    RowKey,
    VersionColumn,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CodecFile {
    Integer,
    BigEndianBytes,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryFile {
    mode: RetryModeFile,
    max_retries: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

impl Default for RetryFile {
    fn default() -> Self {
        Self {
            mode: RetryModeFile::FailFast,
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RetryModeFile {
    FailFast,
    Backoff,
}

impl ConfigFile {
    fn into_config(self) -> ReplicaResult<ReplicaConfig> {
        let batch_size = usize::try_from(self.batch_size)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ReplicaError::invalid_argument("batch_size", format!("{} is not > 0", self.batch_size))
            })?;
        if self.poll_delay_ms <= 0 {
            return Err(ReplicaError::invalid_argument(
                "poll_delay",
                format!("{}ms is not > 0", self.poll_delay_ms),
            ));
        }
        if self.fetch_timeout_secs < 0 {
            return Err(ReplicaError::invalid_argument(
                "fetch_timeout",
                format!("{}s is negative", self.fetch_timeout_secs),
            ));
        }

        let watermark = match self.watermark.mode {
            ModeFile::RowKey => WatermarkMode::RowKey,
            ModeFile::VersionColumn => WatermarkMode::VersionColumn {
                column: self.watermark.column,
                codec: match self.watermark.codec {
                    CodecFile::Integer => WatermarkCodec::Integer,
                    CodecFile::BigEndianBytes => WatermarkCodec::BigEndianBytes {
                        width: self.watermark.width,
                    },
                },
            },
        };

        let failure_policy = match self.retry.mode {
            RetryModeFile::FailFast => FailurePolicy::FailFast,
            RetryModeFile::Backoff => FailurePolicy::RetryWithBackoff {
                max_retries: self.retry.max_retries,
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
        };

        Ok(ReplicaConfig {
            watermark,
            watermark_bound: self.watermark.bound,
            tombstone_column: self.detect_deletes.then_some(self.tombstone_column),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs as u64),
            batch_size,
            poll_delay: Duration::from_millis(self.poll_delay_ms as u64),
            failure_policy,
        })
    }
}
