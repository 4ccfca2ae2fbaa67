//! Coordinate pipeline shutdown
//!
//! A pipeline runs several long-lived tasks: the block trigger and one task per persist worker.
//! When a stop is requested, either by an operator or internally because a block could not be
//! persisted, every one of those tasks must observe the request, finish what it is doing, and
//! report back before the shared buffers can be torn down.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! Tasks [`register`][ShutdownManager::register] to receive a [`ShutdownToken`], which can be
//! used to [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] and then signal back via
//! [`complete`][ShutdownToken::complete]. [`join`][ShutdownManager::join] resolves once every
//! registered token has completed (or been dropped).
//!
//! Components that only need to observe or request shutdown, without holding up
//! [`join`][ShutdownManager::join], take a [`ShutdownSignal`] instead.
use std::sync::Arc;

use observability_deps::tracing::info;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to register signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register signal handler");

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

/// Manage pipeline shutdown
#[derive(Debug)]
pub struct ShutdownManager {
    signal: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            signal: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Register a task that needs to finish its work before shutdown can complete
    ///
    /// Provides a [`ShutdownToken`] which the caller is responsible for handling. The caller must
    /// invoke [`complete`][ShutdownToken::complete], or drop every copy of the token, for
    /// [`join`][Self::join] to return.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.signal.clone(), tx)
    }

    /// Obtain an untracked [`ShutdownSignal`] for this manager
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.signal.clone(),
        }
    }

    /// Waits for registered tasks to complete
    ///
    /// Safe to call more than once; later calls return as soon as the tracked tasks are done.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Invoke shutdown
    ///
    /// Wakes every [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] future so that
    /// registered tasks can clean up before indicating completion. Idempotent.
    pub fn shutdown(&self) {
        self.signal.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Future that completes once shutdown has been requested by anyone
    pub async fn wait_for_shutdown(&self) {
        self.signal.cancelled().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A token that a task can obtain via [`register`][ShutdownManager::register]
///
/// This implements [`Clone`] so that a task can hand copies to the sub-components that may need
/// to trigger shutdown internally.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger shutdown due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that completes when the [`ShutdownManager`] that issued this token is shutdown
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Signal back to the [`ShutdownManager`] that the task that owns this token is finished
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}

/// Observe or request shutdown without being waited on by [`ShutdownManager::join`]
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use futures::FutureExt;

    use crate::ShutdownManager;

    #[tokio::test]
    async fn test_join_waits_for_registered_tasks() {
        let shutdown_manager = ShutdownManager::new();
        let clean = Arc::new(AtomicBool::new(false));

        let token = shutdown_manager.register();
        let task_clean = Arc::clone(&clean);
        tokio::spawn(async move {
            loop {
                futures::select! {
                    _ = token.wait_for_shutdown().fuse() => {
                        task_clean.store(true, Ordering::SeqCst);
                        token.complete();
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)).fuse() => {}
                }
            }
        });

        shutdown_manager.shutdown();
        shutdown_manager.join().await;
        assert!(clean.load(Ordering::SeqCst), "task did not complete cleanup");
    }

    #[tokio::test]
    async fn test_token_triggers_shutdown_for_everyone() {
        let shutdown_manager = ShutdownManager::new();
        let a = shutdown_manager.register();
        let b = shutdown_manager.register();
        let signal = shutdown_manager.signal();

        assert!(!signal.is_shutdown());
        a.trigger_shutdown();
        b.wait_for_shutdown().await;
        signal.wait_for_shutdown().await;
        assert!(shutdown_manager.is_shutdown());

        a.complete();
        drop(b);
        shutdown_manager.join().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_and_join_are_idempotent() {
        let shutdown_manager = ShutdownManager::new();
        let token = shutdown_manager.register();

        shutdown_manager.shutdown();
        shutdown_manager.shutdown();
        token.complete();
        token.complete();

        shutdown_manager.join().await;
        shutdown_manager.join().await;
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn test_signal_does_not_hold_up_join() {
        let shutdown_manager = ShutdownManager::new();
        let _signal = shutdown_manager.signal();
        shutdown_manager.shutdown();
        shutdown_manager.join().await;
    }
}
