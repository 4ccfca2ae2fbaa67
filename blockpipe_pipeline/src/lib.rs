//! A batched ingestion-and-commit pipeline.
//!
//! Records pushed by a [`RecordSource`] travel over an ingest channel into a [`RecordBuffer`]. A
//! background trigger periodically (or once enough records are staged) seals the buffer into an
//! immutable [`Block`], registers it in the [`BlockRegistry`] and hands its id to a persist
//! worker. The worker writes the projected block to a [`BlockSink`], retrying a bounded number of
//! times, and only after the write succeeded acknowledges every record of the block back to the
//! source.
//!
//! ```text
//!   RecordSource ──push──▶ ingest ──▶ RecordBuffer ──seal──▶ BlockRegistry ──id──▶ worker(s)
//!        ▲                                                                             │
//!        └──────────────────────────── acknowledge (after store) ◀─────────────────────┘
//! ```
//!
//! Delivery is at-least-once: a block that cannot be persisted stops the pipeline without
//! acknowledging any of its records, so the source will deliver them again.
use std::sync::Arc;

use blockpipe_id::BlockId;
use parking_lot::Mutex;
use thiserror::Error;

mod block;
mod buffer;
mod ingest;
mod metrics;
mod persist;
mod pipeline;
mod record;
mod registry;
mod retry;
mod sink;
mod source;
pub mod test_util;
mod trigger;

pub use block::Block;
pub use buffer::RecordBuffer;
pub use pipeline::{Pipeline, PipelineArgs, PipelineConfig};
pub use record::{AckError, Acknowledge, Record};
pub use registry::{BlockRegistry, RegistryError};
pub use retry::{BackoffStrategy, DEFAULT_MAX_RETRIES, RetryPolicy};
pub use sink::{BlockSink, Projection};
pub use source::{RecordSource, SourceError, SourceHandle};

/// Boxed error type used at the boundaries with external collaborators.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The reason a pipeline reached its terminal stopped state on its own.
#[derive(Debug, Error)]
pub enum FatalStop {
    #[error("block {block_id} could not be persisted after {attempts} attempts: {source}")]
    Persist {
        block_id: BlockId,
        attempts: usize,
        #[source]
        source: DynError,
    },

    #[error("source reported {count} errors, the last one was: {source}")]
    SourceErrors {
        count: u64,
        #[source]
        source: DynError,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to start record source: {0}")]
    SourceStart(#[source] DynError),

    #[error("pipeline stopped: {0}")]
    Fatal(#[source] Arc<FatalStop>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Holds the first [`FatalStop`] recorded by any pipeline component.
#[derive(Debug, Clone, Default)]
pub(crate) struct FatalSlot(Arc<Mutex<Option<Arc<FatalStop>>>>);

impl FatalSlot {
    /// Record `cause` unless another cause was recorded first. Returns `true` if `cause` won.
    pub(crate) fn set(&self, cause: FatalStop) -> bool {
        let mut slot = self.0.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(cause));
        true
    }

    pub(crate) fn get(&self) -> Option<Arc<FatalStop>> {
        self.0.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_slot_keeps_first_cause() {
        let slot = FatalSlot::default();
        assert!(slot.get().is_none());

        assert!(slot.set(FatalStop::Persist {
            block_id: BlockId::from(7),
            attempts: 4,
            source: "disk full".into(),
        }));
        assert!(!slot.set(FatalStop::SourceErrors {
            count: 1,
            source: "connection reset".into(),
        }));

        let cause = slot.get().unwrap();
        assert!(matches!(
            *cause,
            FatalStop::Persist { attempts: 4, .. }
        ));
        assert_eq!(
            cause.to_string(),
            "block 7 could not be persisted after 4 attempts: disk full"
        );
    }
}
