//! Sealing the accumulator into blocks.

use std::{sync::Arc, time::Duration};

use blockpipe_id::BlockId;
use blockpipe_shutdown::{ShutdownSignal, ShutdownToken};
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::MissedTickBehavior};

use crate::{
    Block, BlockRegistry, RecordBuffer, metrics::PipelineMetrics, persist::PersistHandle,
};

/// Seals the [`RecordBuffer`] into a [`Block`], registers it and dispatches it for persistence.
#[derive(Debug)]
pub(crate) struct BlockTrigger<T> {
    buffer: Arc<RecordBuffer<T>>,
    registry: Arc<BlockRegistry<T>>,
    persist: PersistHandle,
    time_provider: Arc<dyn TimeProvider>,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,

    /// Held while sealing and registering, and by the pipeline while it clears the buffer and
    /// registry on stop, so a block is never registered after the registry was cleared.
    seal_lock: Arc<Mutex<()>>,
}

impl<T> BlockTrigger<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        buffer: Arc<RecordBuffer<T>>,
        registry: Arc<BlockRegistry<T>>,
        persist: PersistHandle,
        time_provider: Arc<dyn TimeProvider>,
        metrics: Arc<PipelineMetrics>,
        shutdown: ShutdownSignal,
        seal_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            buffer,
            registry,
            persist,
            time_provider,
            metrics,
            shutdown,
            seal_lock,
        }
    }

    /// Seal whatever is buffered into a new block and hand it to the persist workers.
    ///
    /// Returns `None` without sealing if the buffer is empty or the pipeline is stopping.
    ///
    /// # Panics
    ///
    /// Panics if the freshly allocated block id is already registered.
    pub(crate) async fn fire(&self) -> Option<BlockId> {
        let (block_id, n_records) = {
            let _guard = self.seal_lock.lock();
            if self.shutdown.is_shutdown() {
                return None;
            }

            let records = self.buffer.seal();
            if records.is_empty() {
                return None;
            }

            let block_id = BlockId::new();
            let n_records = records.len();
            let block = Block::new(block_id, records, self.time_provider.now());
            if let Err(e) = self.registry.register(block) {
                panic!("block trigger produced a non-unique block id: {e}");
            }
            (block_id, n_records)
        };

        self.metrics.blocks_sealed.inc(1);
        debug!(%block_id, n_records, "sealed block");

        if !self.persist.enqueue(block_id, &self.shutdown).await {
            debug!(%block_id, "pipeline stopping, sealed block left unpersisted");
        }
        Some(block_id)
    }
}

/// Fire `trigger` every `interval`, and whenever `size_notify` is signalled, until shutdown.
pub(crate) async fn run_trigger<T>(
    trigger: Arc<BlockTrigger<T>>,
    interval: Duration,
    size_notify: Arc<Notify>,
    token: ShutdownToken,
) where
    T: Send + Sync + 'static,
{
    info!(?interval, "starting block trigger");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.wait_for_shutdown() => break,
            _ = size_notify.notified() => {},
            _ = ticker.tick() => {},
        }
        trigger.fire().await;
    }

    debug!("block trigger stopped");
    token.complete();
}
