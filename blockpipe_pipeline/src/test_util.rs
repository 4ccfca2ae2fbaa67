//! In-memory sources, sinks and acknowledgers for exercising a pipeline in tests.

use std::{
    collections::HashSet,
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use blockpipe_id::{BlockId, RecordKey};
use parking_lot::Mutex;

use crate::{Acknowledge, BlockSink, DynError, RecordSource, SourceError, SourceHandle};

/// Records every acknowledgment, optionally rejecting some keys.
#[derive(Debug, Default)]
pub struct MockAcknowledger {
    state: Mutex<AckState>,
}

#[derive(Debug, Default)]
struct AckState {
    acked: Vec<RecordKey>,
    n_calls: usize,
    fail_for: HashSet<RecordKey>,
}

impl MockAcknowledger {
    /// Reject acknowledgments of `key`.
    pub fn fail_for(&self, key: impl Into<RecordKey>) {
        self.state.lock().fail_for.insert(key.into());
    }

    /// Keys successfully acknowledged, in call order.
    pub fn acked(&self) -> Vec<RecordKey> {
        self.state.lock().acked.clone()
    }

    /// Number of acknowledgment calls, successful or not.
    pub fn n_calls(&self) -> usize {
        self.state.lock().n_calls
    }
}

#[async_trait]
impl Acknowledge for MockAcknowledger {
    async fn acknowledge(&self, key: &RecordKey) -> Result<(), DynError> {
        let mut state = self.state.lock();
        state.n_calls += 1;
        if state.fail_for.contains(key) {
            return Err(format!("mock acknowledgment failure for {key}").into());
        }
        state.acked.push(key.clone());
        Ok(())
    }
}

/// A [`RecordSource`] driven by the test through [`MockSource::push`].
#[derive(Debug)]
pub struct MockSource<T> {
    acker: Arc<MockAcknowledger>,
    handle: Mutex<Option<SourceHandle<T>>>,
    fail_start: Mutex<bool>,
    hang_start: Mutex<bool>,
    n_started: Mutex<usize>,
    n_closed: Mutex<usize>,
}

impl<T> Default for MockSource<T> {
    fn default() -> Self {
        Self {
            acker: Default::default(),
            handle: Default::default(),
            fail_start: Default::default(),
            hang_start: Default::default(),
            n_started: Default::default(),
            n_closed: Default::default(),
        }
    }
}

impl<T> MockSource<T>
where
    T: Send + Sync + 'static,
{
    /// Make the next call to [`RecordSource::start`] fail.
    pub fn fail_start(&self) {
        *self.fail_start.lock() = true;
    }

    /// Make every call to [`RecordSource::start`] wait forever, like a source that never
    /// manages to connect.
    pub fn hang_start(&self) {
        *self.hang_start.lock() = true;
    }

    /// Reject acknowledgments of `key`.
    pub fn fail_ack_for(&self, key: impl Into<RecordKey>) {
        self.acker.fail_for(key);
    }

    /// The handle given to this source when the pipeline started it.
    ///
    /// # Panics
    ///
    /// Panics if the source was never started.
    pub fn handle(&self) -> SourceHandle<T> {
        self.handle
            .lock()
            .clone()
            .expect("mock source has not been started")
    }

    /// Deliver a record through the pipeline's handle.
    pub fn push(&self, key: impl Into<RecordKey>, payload: T) -> Result<(), SourceError> {
        self.handle().push(key, payload)
    }

    pub fn acked(&self) -> Vec<RecordKey> {
        self.acker.acked()
    }

    pub fn n_ack_calls(&self) -> usize {
        self.acker.n_calls()
    }

    pub fn n_started(&self) -> usize {
        *self.n_started.lock()
    }

    pub fn n_closed(&self) -> usize {
        *self.n_closed.lock()
    }

    /// Wait until at least `n` records were acknowledged.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within a few seconds.
    pub async fn wait_for_acks(&self, n: usize) {
        let wait = async {
            while self.acker.acked().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .is_err()
        {
            panic!(
                "timed out waiting for {n} acknowledgments, saw {:?}",
                self.acker.acked()
            );
        }
    }
}

#[async_trait]
impl<T> RecordSource<T> for MockSource<T>
where
    T: Send + Sync + 'static,
{
    async fn start(&self, handle: SourceHandle<T>) -> Result<(), DynError> {
        *self.n_started.lock() += 1;
        let hang = *self.hang_start.lock();
        if hang {
            std::future::pending::<()>().await;
        }
        if std::mem::take(&mut *self.fail_start.lock()) {
            return Err("mock source failed to connect".into());
        }
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledge> {
        Arc::clone(&self.acker) as _
    }

    async fn close(&self) {
        *self.n_closed.lock() += 1;
    }
}

/// A [`BlockSink`] that keeps stored blocks in memory and fails on demand.
#[derive(Debug)]
pub struct MockSink<O> {
    state: Mutex<SinkState<O>>,
}

#[derive(Debug)]
struct SinkState<O> {
    calls: Vec<BlockId>,
    stored: Vec<(BlockId, Vec<O>)>,
    fail_next: usize,
    fail_always: bool,
    failing_blocks: HashSet<BlockId>,
    delay: Option<Duration>,
    paused: bool,
    released: HashSet<BlockId>,
    in_flight: usize,
    max_in_flight: usize,
}

impl<O> Default for MockSink<O> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SinkState {
                calls: vec![],
                stored: vec![],
                fail_next: 0,
                fail_always: false,
                failing_blocks: HashSet::new(),
                delay: None,
                paused: false,
                released: HashSet::new(),
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }
}

impl<O> MockSink<O>
where
    O: Clone,
{
    /// Fail the next `n` store calls.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Fail every store call from now on.
    pub fn fail_always(&self) {
        self.state.lock().fail_always = true;
    }

    /// Fail every store call for `block_id` from now on.
    pub fn fail_block(&self, block_id: BlockId) {
        self.state.lock().failing_blocks.insert(block_id);
    }

    /// Stop failing.
    pub fn succeed(&self) {
        let mut state = self.state.lock();
        state.fail_next = 0;
        state.fail_always = false;
        state.failing_blocks.clear();
    }

    /// Hold every store call in flight until [`resume`][Self::resume] is called.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Let the store calls for `block_id` through while paused.
    pub fn release(&self, block_id: BlockId) {
        self.state.lock().released.insert(block_id);
    }

    /// Let every held store call through.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.released.clear();
    }

    /// Store calls currently running.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// The most store calls that ever ran at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Wait until `n` store calls are running at the same time.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within a few seconds.
    pub async fn wait_for_in_flight(&self, n: usize) {
        let wait = async {
            while self.in_flight() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .is_err()
        {
            panic!(
                "timed out waiting for {n} writes in flight, saw {}",
                self.in_flight()
            );
        }
    }

    fn is_held(&self, block_id: BlockId) -> bool {
        let state = self.state.lock();
        state.paused && !state.released.contains(&block_id)
    }

    /// Sleep for `delay` in every store call before resolving it.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().delay = Some(delay);
        self
    }

    /// Block ids of every store call, in call order.
    pub fn calls(&self) -> Vec<BlockId> {
        self.state.lock().calls.clone()
    }

    /// Number of store calls made for `block_id`.
    pub fn attempts_for(&self, block_id: BlockId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|id| **id == block_id)
            .count()
    }

    /// Successfully stored blocks, in completion order.
    pub fn stored(&self) -> Vec<(BlockId, Vec<O>)> {
        self.state.lock().stored.clone()
    }
}

#[async_trait]
impl<O> BlockSink<O> for MockSink<O>
where
    O: Clone + Debug + Send + Sync + 'static,
{
    async fn store(&self, block_id: BlockId, units: &[O]) -> Result<(), DynError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(block_id);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        while self.is_held(block_id) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.fail_always || state.failing_blocks.contains(&block_id) {
            return Err(format!("mock sink rejected block {block_id}").into());
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(format!("mock sink rejected block {block_id}").into());
        }
        state.stored.push((block_id, units.to_vec()));
        Ok(())
    }
}
