//! The delivery path from [`SourceHandle`](crate::SourceHandle) into the [`RecordBuffer`].

use std::{num::NonZeroUsize, sync::Arc};

use blockpipe_shutdown::ShutdownToken;
use observability_deps::tracing::debug;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::{Record, RecordBuffer, metrics::PipelineMetrics};

/// A message on the ingest channel.
#[derive(Debug)]
pub(crate) enum Ingest<T> {
    /// Append a record to the accumulator.
    Record(Record<T>),

    /// Resolved once every message sent before it has been applied.
    Barrier(oneshot::Sender<()>),
}

pub(crate) type IngestSender<T> = mpsc::UnboundedSender<Ingest<T>>;
pub(crate) type IngestReceiver<T> = mpsc::UnboundedReceiver<Ingest<T>>;

/// Append records received on `rx` to `buffer` in arrival order until shutdown, signalling
/// `size_notify` whenever the buffer reaches `max_block_records`.
///
/// Records still queued when shutdown is requested are dropped unacknowledged.
pub(crate) async fn run_ingest<T>(
    mut rx: IngestReceiver<T>,
    buffer: Arc<RecordBuffer<T>>,
    size_notify: Arc<Notify>,
    max_block_records: Option<NonZeroUsize>,
    metrics: Arc<PipelineMetrics>,
    token: ShutdownToken,
) where
    T: Send + Sync + 'static,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.wait_for_shutdown() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        match msg {
            Ingest::Record(record) => {
                let buffered = buffer.append(record);
                metrics.records_appended.inc(1);
                if max_block_records.is_some_and(|max| buffered >= max.get()) {
                    size_notify.notify_one();
                }
            }
            Ingest::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    rx.close();
    let mut dropped = 0_usize;
    while let Ok(msg) = rx.try_recv() {
        if matches!(msg, Ingest::Record(_)) {
            dropped += 1;
        }
    }
    debug!(dropped, "ingest stopped");
    token.complete();
}
