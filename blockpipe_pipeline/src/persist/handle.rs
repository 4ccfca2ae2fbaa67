use std::sync::Arc;

use blockpipe_id::BlockId;
use blockpipe_shutdown::{ShutdownManager, ShutdownSignal};
use observability_deps::tracing::info;
use tokio::sync::mpsc;

use super::worker::{PersistWorker, run_worker};

/// A persistence task submission handle.
///
/// This type is cheap to clone to share across tasks.
///
/// # Topology
///
/// The [`PersistHandle`] runs `n_workers` worker tasks. Each worker owns a bounded queue of up to
/// `worker_queue_depth` sealed block ids.
///
/// ```text
///                          ┌─────────────┐
///                          │PersistHandle│
///                          └──────┬──────┘
///                                 │  block_id % n_workers
///                ┌────────────────┼────────────────┐
///                │                │                │
///       worker_queue_depth worker_queue_depth worker_queue_depth
///                │                │                │
///                ▼                ▼                ▼
///         ┌────────────┐   ┌────────────┐   ┌────────────┐
///         │  Worker 0  │   │  Worker 1  │   │  Worker N  │
///         └────────────┘   └────────────┘   └────────────┘
/// ```
///
/// A block is only ever placed in one queue and each worker handles its queue sequentially, so
/// the write attempts of one block never overlap. Different blocks may persist in parallel, in
/// which case they can complete in any order.
#[derive(Debug, Clone)]
pub(crate) struct PersistHandle {
    queues: Arc<Vec<mpsc::Sender<BlockId>>>,
}

impl PersistHandle {
    /// Spawn the worker tasks, each registered with `shutdown`, and obtain the handle feeding
    /// them.
    pub(crate) fn new<T, O>(
        n_workers: usize,
        worker_queue_depth: usize,
        worker: Arc<PersistWorker<T, O>>,
        shutdown: &ShutdownManager,
    ) -> Self
    where
        T: Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        assert_ne!(n_workers, 0, "must run at least 1 persist worker");
        assert_ne!(worker_queue_depth, 0, "worker queue depth must be non-zero");

        info!(
            n_workers,
            worker_queue_depth,
            max_queued_blocks = (n_workers * worker_queue_depth),
            "initialised persist workers"
        );

        let queues = (0..n_workers)
            .map(|worker_id| {
                let (tx, rx) = mpsc::channel(worker_queue_depth);
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&worker),
                    rx,
                    shutdown.register(),
                ));
                tx
            })
            .collect();

        Self {
            queues: Arc::new(queues),
        }
    }

    /// Place `block_id` into its worker's queue, waiting for space if the queue is full.
    ///
    /// Returns `false` if the block was not queued because shutdown was requested or the worker
    /// already exited.
    pub(crate) async fn enqueue(&self, block_id: BlockId, shutdown: &ShutdownSignal) -> bool {
        let queue = &self.queues[(block_id.as_u64() % self.queues.len() as u64) as usize];
        tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => false,
            res = queue.send(block_id) => res.is_ok(),
        }
    }
}
