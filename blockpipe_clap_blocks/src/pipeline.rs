//! Config for block sealing, persistence and retry behaviour.

use std::{
    num::{NonZeroU64, NonZeroUsize},
    time::Duration,
};

/// The delay applied between two write attempts of the same block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BackoffKind {
    /// Retry immediately.
    #[default]
    None,

    /// Wait `--write-backoff-initial` between every attempt.
    Fixed,

    /// Double the delay after every failed attempt, starting at `--write-backoff-initial` and
    /// capped at `--write-backoff-max`.
    Exponential,
}

/// CLI config for the ingestion pipeline.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct PipelineConfig {
    /// How often the records buffered so far are sealed into a block.
    #[clap(
        long = "block-interval",
        env = "BLOCKPIPE_BLOCK_INTERVAL",
        default_value = "200ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub block_interval: Duration,

    /// Seal a block early once this many records are buffered.
    ///
    /// When unset, blocks are only sealed on `--block-interval`.
    #[clap(long = "max-block-records", env = "BLOCKPIPE_MAX_BLOCK_RECORDS", action)]
    pub max_block_records: Option<NonZeroUsize>,

    /// Number of tasks persisting sealed blocks in parallel.
    #[clap(
        long = "persist-workers",
        env = "BLOCKPIPE_PERSIST_WORKERS",
        default_value = "1",
        action
    )]
    pub persist_workers: NonZeroUsize,

    /// Number of sealed blocks that may wait in each persist worker's queue.
    #[clap(
        long = "persist-queue-depth",
        env = "BLOCKPIPE_PERSIST_QUEUE_DEPTH",
        default_value = "16",
        action
    )]
    pub persist_queue_depth: NonZeroUsize,

    /// Number of times a failed block write is retried before the pipeline stops.
    #[clap(
        long = "write-max-retries",
        env = "BLOCKPIPE_WRITE_MAX_RETRIES",
        default_value = "3",
        action
    )]
    pub write_max_retries: usize,

    /// Delay strategy between write retries.
    #[clap(
        long = "write-backoff",
        env = "BLOCKPIPE_WRITE_BACKOFF",
        default_value_t = BackoffKind::default(),
        value_enum,
        action
    )]
    pub write_backoff: BackoffKind,

    /// First delay used by the `fixed` and `exponential` backoff strategies.
    #[clap(
        long = "write-backoff-initial",
        env = "BLOCKPIPE_WRITE_BACKOFF_INITIAL",
        default_value = "100ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub write_backoff_initial: Duration,

    /// Upper bound for the `exponential` backoff strategy.
    #[clap(
        long = "write-backoff-max",
        env = "BLOCKPIPE_WRITE_BACKOFF_MAX",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub write_backoff_max: Duration,

    /// Stop the pipeline after this many errors have been reported by the source.
    ///
    /// When unset, source errors are logged and ingestion continues.
    #[clap(
        long = "source-error-threshold",
        env = "BLOCKPIPE_SOURCE_ERROR_THRESHOLD",
        action
    )]
    pub source_error_threshold: Option<NonZeroU64>,
}
