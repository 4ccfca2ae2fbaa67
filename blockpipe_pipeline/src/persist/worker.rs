use std::sync::Arc;

use blockpipe_id::BlockId;
use blockpipe_shutdown::ShutdownToken;
use observability_deps::tracing::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::{
    BlockRegistry, BlockSink, DynError, FatalSlot, FatalStop, Projection, RetryPolicy,
    metrics::PipelineMetrics,
};

/// How the persistence of a single block resolved.
#[derive(Debug)]
pub(super) enum Outcome {
    /// Stored and acknowledged, the registry entry is gone.
    Committed,

    /// A write failed and shutdown was requested before the next attempt. Nothing was
    /// acknowledged.
    Abandoned,

    /// The block was no longer registered, typically because the pipeline was cleared.
    Missing,

    /// The retry budget is exhausted. Nothing was acknowledged and the registry entry is left in
    /// place.
    Fatal(FatalStop),
}

/// The state shared by all persist worker tasks.
#[derive(Debug)]
pub(crate) struct PersistWorker<T, O> {
    registry: Arc<BlockRegistry<T>>,
    sink: Arc<dyn BlockSink<O>>,
    projection: Projection<T, O>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    fatal: FatalSlot,
}

impl<T, O> PersistWorker<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub(crate) fn new(
        registry: Arc<BlockRegistry<T>>,
        sink: Arc<dyn BlockSink<O>>,
        projection: Projection<T, O>,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
        fatal: FatalSlot,
    ) -> Self {
        Self {
            registry,
            sink,
            projection,
            retry,
            metrics,
            fatal,
        }
    }

    /// Write the block to the sink, retrying within the configured bound, and acknowledge its
    /// records once the write succeeded.
    ///
    /// Attempts for one block are strictly sequential. A write that is already running when
    /// shutdown is requested is allowed to finish.
    pub(super) async fn persist(&self, block_id: BlockId, token: &ShutdownToken) -> Outcome {
        let block = match self.registry.lookup(block_id) {
            Ok(b) => b,
            Err(e) => {
                error!(%block_id, error = %e, "sealed block vanished before it was persisted");
                return Outcome::Missing;
            }
        };

        let units = block
            .records()
            .iter()
            .map(|r| self.projection.project(r.payload()))
            .collect::<Vec<_>>();

        let mut attempts = 0;
        loop {
            attempts += 1;
            let err: DynError = match self.sink.store(block_id, &units).await {
                Ok(()) => break,
                Err(e) => e,
            };

            if !self.retry.should_retry(attempts) {
                error!(
                    %block_id,
                    attempts,
                    error = %err,
                    "block write failed, retry budget exhausted"
                );
                return Outcome::Fatal(FatalStop::Persist {
                    block_id,
                    attempts,
                    source: err,
                });
            }

            warn!(
                %block_id,
                attempts,
                max_attempts = self.retry.max_attempts(),
                error = %err,
                "block write failed, retrying"
            );
            self.metrics.write_retries.inc(1);

            if token.is_shutdown() {
                return Outcome::Abandoned;
            }
            let delay = self.retry.backoff.delay_for_retry(attempts);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.wait_for_shutdown() => return Outcome::Abandoned,
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        }

        debug!(%block_id, attempts, n_records = block.len(), "block stored");

        for record in block.records() {
            if let Err(e) = record.acknowledge().await {
                self.metrics.ack_failures.inc(1);
                warn!(%block_id, error = %e, "record acknowledgment failed");
            }
        }

        self.metrics.blocks_committed.inc(1);
        self.registry.evict(block_id);
        Outcome::Committed
    }
}

/// Drain `rx`, persisting one block at a time, until shutdown or a fatal write failure.
pub(super) async fn run_worker<T, O>(
    worker_id: usize,
    worker: Arc<PersistWorker<T, O>>,
    mut rx: mpsc::Receiver<BlockId>,
    token: ShutdownToken,
) where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    debug!(worker_id, "persist worker started");

    loop {
        let block_id = tokio::select! {
            biased;
            _ = token.wait_for_shutdown() => break,
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        match worker.persist(block_id, &token).await {
            Outcome::Committed | Outcome::Missing => {}
            Outcome::Abandoned => {
                info!(worker_id, %block_id, "shutdown requested, block left unacknowledged");
                break;
            }
            Outcome::Fatal(cause) => {
                worker.fatal.set(cause);
                token.trigger_shutdown();
                break;
            }
        }
    }

    debug!(worker_id, "persist worker stopped");
    token.complete();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blockpipe_id::RecordKey;
    use blockpipe_shutdown::ShutdownManager;
    use iox_time::Time;
    use metric::Registry;

    use super::*;
    use crate::{
        BackoffStrategy, Block, Record,
        test_util::{MockAcknowledger, MockSink},
    };

    struct Fixture {
        registry: Arc<BlockRegistry<u32>>,
        sink: Arc<MockSink<u32>>,
        acker: Arc<MockAcknowledger>,
        fatal: FatalSlot,
        worker: PersistWorker<u32, u32>,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let registry = Arc::new(BlockRegistry::new());
        let sink = Arc::new(MockSink::default());
        let acker = Arc::new(MockAcknowledger::default());
        let fatal = FatalSlot::default();
        let worker = PersistWorker::new(
            Arc::clone(&registry),
            Arc::clone(&sink) as _,
            Projection::new(|v: &u32| v * 10),
            retry,
            Arc::new(PipelineMetrics::new(&Registry::new())),
            fatal.clone(),
        );
        Fixture {
            registry,
            sink,
            acker,
            fatal,
            worker,
        }
    }

    fn register(f: &Fixture, id: u64, keys: &[&str]) -> BlockId {
        let id = BlockId::from(id);
        let records = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Record::new(*k, i as u32, Arc::clone(&f.acker) as _))
            .collect();
        f.registry
            .register(Block::new(id, records, Time::from_timestamp_nanos(0)))
            .unwrap();
        id
    }

    fn keys(keys: &[&str]) -> Vec<RecordKey> {
        keys.iter().map(|k| RecordKey::from(*k)).collect()
    }

    #[test_log::test(tokio::test)]
    async fn commit_acknowledges_then_evicts() {
        let f = fixture(RetryPolicy::default());
        let id = register(&f, 1, &["a", "b", "c"]);
        let shutdown = ShutdownManager::new();

        let outcome = f.worker.persist(id, &shutdown.register()).await;
        assert!(matches!(outcome, Outcome::Committed));
        assert_eq!(f.sink.stored(), vec![(id, vec![0, 10, 20])]);
        assert_eq!(f.acker.acked(), keys(&["a", "b", "c"]));
        assert!(!f.registry.contains(id));
    }

    #[test_log::test(tokio::test)]
    async fn retries_within_bound() {
        for k in 0..=3 {
            let f = fixture(RetryPolicy::default());
            f.sink.fail_next(k);
            let id = register(&f, 1, &["a"]);
            let shutdown = ShutdownManager::new();

            let outcome = f.worker.persist(id, &shutdown.register()).await;
            assert!(matches!(outcome, Outcome::Committed), "k = {k}");
            assert_eq!(f.sink.attempts_for(id), k + 1, "k = {k}");
            assert_eq!(f.acker.n_calls(), 1, "k = {k}");
        }
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_are_fatal_without_acks() {
        let f = fixture(RetryPolicy::default());
        f.sink.fail_next(4);
        let id = register(&f, 1, &["a", "b"]);
        let shutdown = ShutdownManager::new();

        let outcome = f.worker.persist(id, &shutdown.register()).await;
        let (block_id, attempts) = match outcome {
            Outcome::Fatal(FatalStop::Persist {
                block_id, attempts, ..
            }) => (block_id, attempts),
            other => panic!("expected fatal outcome, got {other:?}"),
        };
        assert_eq!(block_id, id);
        assert_eq!(attempts, 4);
        assert_eq!(f.sink.attempts_for(id), 4);
        assert_eq!(f.acker.n_calls(), 0);
        // left for teardown
        assert!(f.registry.contains(id));
    }

    #[test_log::test(tokio::test)]
    async fn ack_failure_does_not_stop_the_rest() {
        let f = fixture(RetryPolicy::default());
        f.acker.fail_for("b");
        let id = register(&f, 1, &["a", "b", "c"]);
        let shutdown = ShutdownManager::new();

        let outcome = f.worker.persist(id, &shutdown.register()).await;
        assert!(matches!(outcome, Outcome::Committed));
        assert_eq!(f.sink.attempts_for(id), 1);
        assert_eq!(f.acker.acked(), keys(&["a", "c"]));
        assert_eq!(f.acker.n_calls(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_interrupts_backoff() {
        let f = fixture(RetryPolicy::new(
            3,
            BackoffStrategy::Fixed(Duration::from_secs(3600)),
        ));
        f.sink.fail_always();
        let id = register(&f, 1, &["a"]);
        let shutdown = ShutdownManager::new();
        let token = shutdown.register();

        let persist = f.worker.persist(id, &token);
        tokio::pin!(persist);
        tokio::select! {
            _ = &mut persist => panic!("persist should be sleeping in backoff"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {},
        }
        shutdown.shutdown();

        let outcome = tokio::time::timeout(Duration::from_secs(5), persist)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Abandoned));
        assert_eq!(f.sink.attempts_for(id), 1);
        assert_eq!(f.acker.n_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn missing_block_is_skipped() {
        let f = fixture(RetryPolicy::default());
        let shutdown = ShutdownManager::new();

        let outcome = f.worker.persist(BlockId::from(99), &shutdown.register()).await;
        assert!(matches!(outcome, Outcome::Missing));
        assert!(f.sink.calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn fatal_failure_stops_the_worker() {
        let f = fixture(RetryPolicy::new(1, BackoffStrategy::None));
        f.sink.fail_always();
        let id = register(&f, 1, &["a"]);
        let fatal = f.fatal.clone();
        let shutdown = ShutdownManager::new();

        let (tx, rx) = mpsc::channel(1);
        tx.send(id).await.unwrap();
        tokio::spawn(run_worker(0, Arc::new(f.worker), rx, shutdown.register()));

        tokio::time::timeout(Duration::from_secs(5), shutdown.join())
            .await
            .expect("worker should stop itself");
        assert!(shutdown.is_shutdown());
        assert!(matches!(
            *fatal.get().unwrap(),
            FatalStop::Persist { attempts: 2, .. }
        ));
        assert_eq!(f.acker.n_calls(), 0);
    }
}
