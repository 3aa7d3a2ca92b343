// ABOUTME: Watermark type and codec between source representation and ordered u64
// ABOUTME: Version counters travel as big-endian bytes; integer row keys map directly

use crate::error::{ReplicaError, ReplicaResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Totally ordered position in a source table's change stream.
///
/// Rows with a watermark greater than a reader's cursor have not been seen yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(u64);

impl Watermark {
    /// Cursor value before anything has been read.
    pub const ZERO: Watermark = Watermark(0);

    pub const fn new(value: u64) -> Self {
        Watermark(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Watermark {
    fn from(value: u64) -> Self {
        Watermark(value)
    }
}

/// How a source represents watermark values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatermarkCodec {
    /// Native integer column (identity keys, bigint sequences).
    Integer,
    /// Fixed-width big-endian byte string (SQL Server `rowversion`, bytea counters).
    ///
    /// `width` is the length produced by `encode`; `decode` accepts any length
    /// whose value fits in 64 bits.
    BigEndianBytes { width: usize },
}

impl Default for WatermarkCodec {
    fn default() -> Self {
        WatermarkCodec::BigEndianBytes { width: 8 }
    }
}

impl WatermarkCodec {
    /// Convert a cursor into the parameter bound in `WHERE w > :since`.
    pub fn encode(&self, watermark: Watermark) -> ReplicaResult<Value> {
        match *self {
            WatermarkCodec::Integer => i64::try_from(watermark.get())
                .map(Value::Integer)
                .map_err(|_| {
                    ReplicaError::Watermark(format!(
                        "{} does not fit in a signed 64-bit column",
                        watermark
                    ))
                }),
            WatermarkCodec::BigEndianBytes { width } => {
                let full = watermark.get().to_be_bytes();
                if width >= full.len() {
                    let mut out = vec![0u8; width - full.len()];
                    out.extend_from_slice(&full);
                    return Ok(Value::Bytes(out));
                }
                let (dropped, kept) = full.split_at(full.len() - width);
                if dropped.iter().any(|b| *b != 0) {
                    return Err(ReplicaError::Watermark(format!(
                        "{} does not fit in {} bytes",
                        watermark, width
                    )));
                }
                Ok(Value::Bytes(kept.to_vec()))
            }
        }
    }

    /// Convert a fetched column value into a comparable watermark.
    pub fn decode(&self, raw: &Value) -> ReplicaResult<Watermark> {
        match (self, raw) {
            (WatermarkCodec::Integer, Value::Integer(i)) => u64::try_from(*i)
                .map(Watermark)
                .map_err(|_| ReplicaError::Watermark(format!("negative watermark {}", i))),
            (WatermarkCodec::BigEndianBytes { .. }, Value::Bytes(bytes)) => decode_be(bytes),
            (_, other) => Err(ReplicaError::Watermark(format!(
                "cannot decode {} value {} with {:?} codec",
                other.kind(),
                other,
                self
            ))),
        }
    }

    pub(crate) fn is_bytes(&self) -> bool {
        matches!(self, WatermarkCodec::BigEndianBytes { .. })
    }
}

/// Interpret `bytes` as an unsigned big-endian integer, independent of host
/// byte order. Leading zero bytes beyond eight are permitted.
fn decode_be(bytes: &[u8]) -> ReplicaResult<Watermark> {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => return Ok(Watermark::ZERO),
    };
    if significant.len() > 8 {
        return Err(ReplicaError::Watermark(format!(
            "{}-byte value exceeds 64 bits",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf[8 - significant.len()..].copy_from_slice(significant);
    Ok(Watermark(u64::from_be_bytes(buf)))
}
