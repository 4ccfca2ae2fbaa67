//! Identifiers shared across the ingestion pipeline.
//!
//! [`BlockId`]s are handed out from a process-wide counter, so two pipelines running in the same
//! process never produce the same block identifier. [`RecordKey`]s are assigned by the record
//! source and are opaque to the pipeline.
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies one sealed block of records.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct BlockId(u64);

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

impl BlockId {
    /// Allocate the next unused [`BlockId`]
    pub fn new() -> Self {
        Self(
            NEXT_BLOCK_ID
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .expect("Overflowed with Block IDs"),
        )
    }

    /// The id that the next call to [`BlockId::new`] will return
    pub fn next_id() -> Self {
        Self(NEXT_BLOCK_ID.load(Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The stable, source-assigned key of a single change-log record.
///
/// Cloning is cheap; the key is reference counted.
#[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct RecordKey(Arc<str>);

impl RecordKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
