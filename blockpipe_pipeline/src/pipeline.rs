//! Wiring and lifecycle of a running pipeline.

use std::{
    num::{NonZeroU64, NonZeroUsize},
    sync::{Arc, OnceLock},
    time::Duration,
};

use blockpipe_id::BlockId;
use blockpipe_shutdown::ShutdownManager;
use iox_time::TimeProvider;
use observability_deps::tracing::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    BlockRegistry, BlockSink, Error, FatalSlot, FatalStop, Projection, RecordBuffer, RecordSource,
    Result, RetryPolicy, SourceHandle,
    ingest::{Ingest, IngestSender, run_ingest},
    metrics::PipelineMetrics,
    persist::{PersistHandle, PersistWorker},
    trigger::{BlockTrigger, run_trigger},
};

const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_WORKER_QUEUE_DEPTH: NonZeroUsize = NonZeroUsize::new(16).unwrap();

/// Tuning of the sealing cadence, persistence parallelism and retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How often the buffered records are sealed into a block.
    pub block_interval: Duration,

    /// Seal early once this many records are buffered.
    pub max_block_records: Option<NonZeroUsize>,

    /// Number of persist worker tasks.
    pub n_workers: NonZeroUsize,

    /// Sealed blocks that may wait in each worker's queue before the trigger waits for space.
    pub worker_queue_depth: NonZeroUsize,

    pub retry: RetryPolicy,

    /// Stop the pipeline once the source reported this many errors. Unset means source errors
    /// are only logged.
    pub source_error_threshold: Option<NonZeroU64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_interval: DEFAULT_BLOCK_INTERVAL,
            max_block_records: None,
            n_workers: NonZeroUsize::MIN,
            worker_queue_depth: DEFAULT_WORKER_QUEUE_DEPTH,
            retry: RetryPolicy::default(),
            source_error_threshold: None,
        }
    }
}

/// Everything needed to construct a [`Pipeline`].
#[derive(Debug)]
pub struct PipelineArgs<T, O> {
    pub config: PipelineConfig,
    pub source: Arc<dyn RecordSource<T>>,
    pub sink: Arc<dyn BlockSink<O>>,
    pub projection: Projection<T, O>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub metric_registry: Arc<metric::Registry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    /// Tasks are running and the source is connecting.
    Starting,
    Running,
    Stopped,
}

/// A batched ingestion-and-commit pipeline between one [`RecordSource`] and one [`BlockSink`].
///
/// A pipeline runs at most once: [`start`][Self::start] wires the buffer, registry, trigger and
/// persist workers together and starts the source, [`stop`][Self::stop] tears everything down
/// without acknowledging anything that was not yet persisted. Both are idempotent, and a stopped
/// pipeline cannot be restarted.
///
/// The pipeline also stops on its own when a block cannot be persisted within the retry bound;
/// [`wait_for_stop`][Self::wait_for_stop] then reports the cause.
///
/// Dropping a pipeline requests shutdown.
#[derive(Debug)]
pub struct Pipeline<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    inner: Arc<Inner<T, O>>,
}

#[derive(Debug)]
struct Inner<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    config: PipelineConfig,
    source: Arc<dyn RecordSource<T>>,
    sink: Arc<dyn BlockSink<O>>,
    projection: Projection<T, O>,
    time_provider: Arc<dyn TimeProvider>,
    metrics: Arc<PipelineMetrics>,

    lifecycle: tokio::sync::Mutex<Lifecycle>,
    buffer: Arc<RecordBuffer<T>>,
    registry: Arc<BlockRegistry<T>>,
    ingest: OnceLock<IngestSender<T>>,
    trigger: OnceLock<Arc<BlockTrigger<T>>>,
    seal_lock: Arc<Mutex<()>>,
    seal_notify: Arc<Notify>,

    shutdown: ShutdownManager,
    fatal: FatalSlot,
    /// Cancelled once a call to [`RecordSource::start`] returned or was abandoned.
    start_settled: CancellationToken,
    stopped: CancellationToken,
}

impl<T, O> Pipeline<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn new(args: PipelineArgs<T, O>) -> Self {
        let PipelineArgs {
            config,
            source,
            sink,
            projection,
            time_provider,
            metric_registry,
        } = args;

        Self {
            inner: Arc::new(Inner {
                config,
                source,
                sink,
                projection,
                time_provider,
                metrics: Arc::new(PipelineMetrics::new(&metric_registry)),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Created),
                buffer: Arc::new(RecordBuffer::new()),
                registry: Arc::new(BlockRegistry::new()),
                ingest: OnceLock::new(),
                trigger: OnceLock::new(),
                seal_lock: Default::default(),
                seal_notify: Default::default(),
                shutdown: ShutdownManager::new(),
                fatal: FatalSlot::default(),
                start_settled: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the ingest, trigger and persist worker tasks, then start the source.
    ///
    /// Calling this on a running or stopped pipeline logs a warning and does nothing. If the
    /// source fails to start the pipeline is stopped and the error returned.
    ///
    /// A [`stop`][Self::stop] issued while the source is still connecting abandons the
    /// connection attempt, closes the source and makes this return `Ok(())`.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Starting | Lifecycle::Running => {
                warn!("pipeline already started");
                return Ok(());
            }
            Lifecycle::Stopped => {
                warn!("pipeline already stopped, it cannot be restarted");
                return Ok(());
            }
        }

        let config = inner.config;
        let worker = Arc::new(PersistWorker::new(
            Arc::clone(&inner.registry),
            Arc::clone(&inner.sink),
            inner.projection.clone(),
            config.retry,
            Arc::clone(&inner.metrics),
            inner.fatal.clone(),
        ));
        let persist = PersistHandle::new(
            config.n_workers.get(),
            config.worker_queue_depth.get(),
            worker,
            &inner.shutdown,
        );

        let trigger = Arc::new(BlockTrigger::new(
            Arc::clone(&inner.buffer),
            Arc::clone(&inner.registry),
            persist,
            Arc::clone(&inner.time_provider),
            Arc::clone(&inner.metrics),
            inner.shutdown.signal(),
            Arc::clone(&inner.seal_lock),
        ));
        // Lifecycle::Created is only ever left once, so the cells are always empty here.
        let _ = inner.trigger.set(Arc::clone(&trigger));
        tokio::spawn(run_trigger(
            trigger,
            config.block_interval,
            Arc::clone(&inner.seal_notify),
            inner.shutdown.register(),
        ));

        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let _ = inner.ingest.set(ingest_tx.clone());
        tokio::spawn(run_ingest(
            ingest_rx,
            Arc::clone(&inner.buffer),
            Arc::clone(&inner.seal_notify),
            config.max_block_records,
            Arc::clone(&inner.metrics),
            inner.shutdown.register(),
        ));

        // Tear down once anyone requests shutdown: a fatal write failure, the source error
        // threshold, an explicit stop or the pipeline being dropped.
        let supervised = Arc::clone(inner);
        tokio::spawn(async move {
            supervised.shutdown.wait_for_shutdown().await;
            supervised.stop().await;
        });

        *lifecycle = Lifecycle::Starting;
        // A stop waits for the source to settle before closing it, even if this future is
        // dropped mid-start.
        let settled = inner.start_settled.clone().drop_guard();
        drop(lifecycle);

        let handle = SourceHandle::new(
            ingest_tx,
            inner.source.acknowledger(),
            config.source_error_threshold,
            inner.fatal.clone(),
            inner.shutdown.signal(),
            Arc::clone(&inner.metrics),
        );
        let started = tokio::select! {
            biased;
            _ = inner.shutdown.wait_for_shutdown() => None,
            res = inner.source.start(handle) => Some(res),
        };
        drop(settled);

        let mut lifecycle = inner.lifecycle.lock().await;
        match started {
            Some(Ok(())) if *lifecycle == Lifecycle::Starting => {
                *lifecycle = Lifecycle::Running;
            }
            Some(Ok(())) | None => {
                info!("pipeline stopped while the record source was starting");
                return Ok(());
            }
            Some(Err(e)) => {
                error!(error = %e, "record source failed to start");
                inner.stop_locked(&mut lifecycle).await;
                return Err(Error::SourceStart(e));
            }
        }
        drop(lifecycle);

        info!(
            block_interval = ?config.block_interval,
            max_block_records = config.max_block_records.map(NonZeroUsize::get),
            n_workers = config.n_workers.get(),
            max_attempts = config.retry.max_attempts(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stop the pipeline.
    ///
    /// Stops sealing, lets any write attempt already running finish, releases the source and
    /// discards every record and block that was not yet persisted, without acknowledging them.
    /// Idempotent, and safe to call before or concurrently with [`start`][Self::start].
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Seal every record pushed so far into a block now, instead of waiting for the trigger.
    ///
    /// Returns `None` if nothing was buffered, or the pipeline is not running.
    pub async fn force_seal(&self) -> Option<BlockId> {
        let ingest = self.inner.ingest.get()?;
        let trigger = self.inner.trigger.get()?;

        // Records pushed before this call are ahead of the barrier on the ingest channel.
        let (tx, rx) = oneshot::channel();
        ingest.send(Ingest::Barrier(tx)).ok()?;
        rx.await.ok()?;

        trigger.fire().await
    }

    /// Wait until the pipeline reached its stopped state.
    ///
    /// Returns the cause if the pipeline stopped itself.
    pub async fn wait_for_stop(&self) -> Result<()> {
        self.inner.stopped.cancelled().await;
        match self.inner.fatal.get() {
            Some(cause) => Err(Error::Fatal(cause)),
            None => Ok(()),
        }
    }

    /// The reason the pipeline stopped itself, if it did.
    pub fn fatal_cause(&self) -> Option<Arc<FatalStop>> {
        self.inner.fatal.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// Records appended to the accumulator but not yet sealed into a block.
    pub fn buffered_records(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Sealed blocks not yet persisted and acknowledged.
    pub fn registered_blocks(&self) -> usize {
        self.inner.registry.len()
    }
}

impl<T, O> Drop for Pipeline<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.shutdown.shutdown();
    }
}

impl<T, O> Inner<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        let was_started = match *lifecycle {
            Lifecycle::Stopped => return,
            Lifecycle::Created => false,
            Lifecycle::Starting | Lifecycle::Running => true,
        };

        info!("stopping pipeline");
        self.shutdown.shutdown();

        if was_started {
            self.shutdown.join().await;
            self.start_settled.cancelled().await;
            self.source.close().await;
        }

        let (discarded_records, discarded_blocks) = {
            let _guard = self.seal_lock.lock();
            (self.buffer.clear(), self.registry.clear())
        };

        *lifecycle = Lifecycle::Stopped;
        self.stopped.cancel();

        match self.fatal.get() {
            Some(cause) => error!(
                %cause,
                discarded_records,
                discarded_blocks,
                "pipeline stopped"
            ),
            None => info!(discarded_records, discarded_blocks, "pipeline stopped"),
        }
    }
}
