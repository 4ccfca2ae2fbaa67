//! Config for the tokio runtime that drives the pipeline.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio runtime.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioRuntimeConfig {
    /// Set the maximum number of runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-threads", env = "BLOCKPIPE_NUM_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// Tokio runtime type.
    #[clap(
        long = "runtime-type",
        env = "BLOCKPIPE_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Specifies the limit for additional threads spawned by the runtime.
    ///
    /// Sink implementations that perform blocking file IO run on these threads.
    #[clap(
        long = "runtime-max-blocking-threads",
        env = "BLOCKPIPE_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool of the runtime.
    #[clap(
        long = "runtime-thread-keep-alive",
        env = "BLOCKPIPE_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioRuntimeConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<::tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here, logging is initialised inside the runtime.
        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => ::tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => {
                let mut builder = ::tokio::runtime::Builder::new_multi_thread();
                let num_threads = match self.num_threads {
                    None => std::thread::available_parallelism()?,
                    Some(n) => n,
                };
                builder.worker_threads(num_threads.get());
                builder
            }
        };

        builder.enable_all();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "blockpipe tokio {}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        if let Some(x) = self.max_blocking_threads {
            builder.max_blocking_threads(x.get());
        }

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use std::ffi::OsString;

    #[test]
    fn test_defaults() {
        let config = TokioRuntimeConfig::parse_from(std::iter::empty::<OsString>());
        assert_eq!(config.runtime_type, TokioRuntimeType::MultiThread);
        assert!(config.num_threads.is_none());
    }

    #[test]
    fn test_thread_name() {
        let config = TokioRuntimeConfig::parse_from(["blockpipe", "--num-threads", "2"]);
        let rt = config.builder().unwrap().build().unwrap();
        rt.block_on(async move {
            tokio::spawn(async move {
                let thread = std::thread::current();
                let name = thread.name().expect("thread is named");
                assert!(name.starts_with("blockpipe tokio"), "unexpected name {name}");
            })
            .await
            .unwrap();
        });
    }

    #[test]
    fn test_current_thread_runtime_has_timers() {
        let config =
            TokioRuntimeConfig::parse_from(["blockpipe", "--runtime-type", "current-thread"]);
        let rt = config.builder().unwrap().build().unwrap();
        rt.block_on(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
        });
    }
}
