//! The surface an external change-log source uses to feed the pipeline.

use std::{
    fmt::Debug,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use blockpipe_id::RecordKey;
use blockpipe_shutdown::ShutdownSignal;
use observability_deps::tracing::{error, warn};
use thiserror::Error;

use crate::{
    Acknowledge, DynError, FatalSlot, FatalStop, Record,
    ingest::{Ingest, IngestSender},
    metrics::PipelineMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("pipeline is stopped and no longer accepts records")]
    Closed,
}

/// An external source of change-log records.
///
/// The pipeline calls [`start`][Self::start] once, handing over the [`SourceHandle`] records are
/// pushed into, and [`close`][Self::close] once when it stops. Records are acknowledged through
/// the [`Acknowledge`] capability returned by [`acknowledger`][Self::acknowledger], strictly after
/// the block that contains them was persisted.
#[async_trait]
pub trait RecordSource<T>: Send + Sync + Debug
where
    T: Send + Sync + 'static,
{
    /// Begin delivering records into `handle`.
    ///
    /// Implementations that deliver continuously should spawn their delivery loop and return once
    /// the connection is established.
    async fn start(&self, handle: SourceHandle<T>) -> Result<(), DynError>;

    /// The capability used to acknowledge records delivered by this source.
    fn acknowledger(&self) -> Arc<dyn Acknowledge>;

    /// Release the connection to the source. Called once, after the pipeline's tasks stopped.
    async fn close(&self);
}

#[derive(Debug)]
struct SourceErrors {
    count: AtomicU64,
    threshold: Option<NonZeroU64>,
}

/// A cheaply cloneable handle through which a [`RecordSource`] pushes records and reports errors.
pub struct SourceHandle<T> {
    inner: Arc<HandleInner<T>>,
}

#[derive(Debug)]
struct HandleInner<T> {
    ingest: IngestSender<T>,
    acker: Arc<dyn Acknowledge>,
    errors: SourceErrors,
    fatal: FatalSlot,
    shutdown: ShutdownSignal,
    metrics: Arc<PipelineMetrics>,
}

impl<T> SourceHandle<T> {
    pub(crate) fn new(
        ingest: IngestSender<T>,
        acker: Arc<dyn Acknowledge>,
        source_error_threshold: Option<NonZeroU64>,
        fatal: FatalSlot,
        shutdown: ShutdownSignal,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                ingest,
                acker,
                errors: SourceErrors {
                    count: AtomicU64::new(0),
                    threshold: source_error_threshold,
                },
                fatal,
                shutdown,
                metrics,
            }),
        }
    }

    /// Hand a record to the pipeline.
    ///
    /// Never waits: the record is queued for the block currently being filled, in push order.
    /// Fails with [`SourceError::Closed`] once the pipeline is stopping, in which case the record
    /// was not taken and will never be acknowledged.
    pub fn push(&self, key: impl Into<RecordKey>, payload: T) -> Result<(), SourceError> {
        let inner = &self.inner;
        if inner.shutdown.is_shutdown() {
            return Err(SourceError::Closed);
        }

        let record = Record::new(key, payload, Arc::clone(&inner.acker));
        inner
            .ingest
            .send(Ingest::Record(record))
            .map_err(|_| SourceError::Closed)
    }

    /// Report an error observed on the source connection.
    ///
    /// Errors are logged and counted. Unless a source error threshold is configured they never
    /// stop the pipeline.
    pub fn report_error(&self, error: impl Into<DynError>) {
        let error = error.into();
        let inner = &self.inner;
        inner.metrics.source_errors.inc(1);
        let count = inner.errors.count.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(%error, count, "record source reported an error");

        let Some(threshold) = inner.errors.threshold else {
            return;
        };
        if count >= threshold.get() {
            error!(
                count,
                threshold = threshold.get(),
                "source error threshold reached, stopping pipeline"
            );
            inner.fatal.set(FatalStop::SourceErrors {
                count,
                source: error,
            });
            inner.shutdown.trigger_shutdown();
        }
    }

    /// Whether the pipeline has stopped accepting records.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_shutdown()
    }

    pub fn errors_reported(&self) -> u64 {
        self.inner.errors.count.load(Ordering::Acquire)
    }
}

impl<T> Clone for SourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for SourceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("errors", &self.inner.errors)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
