//! Entrypoint for running a pipeline from a line source into an output directory.

use std::{future::Future, sync::Arc, time::Duration};

use blockpipe_clap_blocks::{
    pipeline::{BackoffKind, PipelineConfig as PipelineCliConfig},
    source::{SourceConfig, SourceConfigError},
    storage::StorageConfig,
};
use blockpipe_pipeline::{
    BackoffStrategy, Pipeline, PipelineArgs, PipelineConfig, Projection, RetryPolicy,
};
use blockpipe_shutdown::wait_for_signal;
use iox_time::SystemProvider;
use observability_deps::tracing::{info, warn};
use serde_json::{Value, json};
use thiserror::Error;
use trogging::cli::LoggingConfig;

use crate::{
    sink::DirectorySink,
    source::{Line, LineSource, line_key},
};

/// How often the registry is checked while draining after the end of input.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("invalid source config: {0}")]
    SourceConfig(#[from] SourceConfigError),

    #[error("failed to set up output directory: {0:#}")]
    Sink(#[source] anyhow::Error),

    #[error("reading the source input failed: {0}")]
    Input(#[source] std::io::Error),

    #[error(transparent)]
    Pipeline(#[from] blockpipe_pipeline::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// pipeline options
    #[clap(flatten)]
    pub(crate) pipeline_config: PipelineCliConfig,

    /// source options
    #[clap(flatten)]
    pub(crate) source_config: SourceConfig,

    /// output options
    #[clap(flatten)]
    pub(crate) storage_config: StorageConfig,
}

/// Translate the CLI options into the pipeline's own config.
fn pipeline_config(c: &PipelineCliConfig) -> PipelineConfig {
    let backoff = match c.write_backoff {
        BackoffKind::None => BackoffStrategy::None,
        BackoffKind::Fixed => BackoffStrategy::Fixed(c.write_backoff_initial),
        BackoffKind::Exponential => BackoffStrategy::Exponential {
            initial: c.write_backoff_initial,
            max: c.write_backoff_max,
        },
    };

    PipelineConfig {
        block_interval: c.block_interval,
        max_block_records: c.max_block_records,
        n_workers: c.persist_workers,
        worker_queue_depth: c.persist_queue_depth,
        retry: RetryPolicy::new(c.write_max_retries, backoff),
        source_error_threshold: c.source_error_threshold,
    }
}

/// Wrap a line as `{ "key", "payload" }`, embedding the payload as JSON when it parses as such.
fn json_projection(consumer_id: String) -> Projection<Line, Value> {
    Projection::new(move |line: &Line| {
        let payload = serde_json::from_str(&line.text).unwrap_or_else(|_| json!(line.text));
        json!({
            "key": line_key(&consumer_id, line.number).as_str(),
            "payload": payload,
        })
    })
}

pub(crate) async fn command(config: Config) -> Result<()> {
    config.source_config.validate()?;
    let input = config.source_config.endpoint()?.to_owned();
    let consumer_id = config.source_config.consumer_id.clone();
    info!(
        %input,
        %consumer_id,
        private_network = config.source_config.use_private_network,
        access_key_id = config.source_config.access_key_id.as_deref().unwrap_or("<none>"),
        "blockpipe starting"
    );

    let source = Arc::new(LineSource::new(input, consumer_id.clone()));
    let sink = Arc::new(
        DirectorySink::new(&config.storage_config)
            .await
            .map_err(Error::Sink)?,
    );

    let pipeline = Pipeline::new(PipelineArgs {
        config: pipeline_config(&config.pipeline_config),
        source: Arc::clone(&source) as _,
        sink: sink as _,
        projection: json_projection(consumer_id),
        time_provider: Arc::new(SystemProvider::new()),
        metric_registry: Arc::new(metric::Registry::new()),
    });
    pipeline.start().await?;

    run_until(&pipeline, &source, wait_for_signal()).await;

    pipeline.stop().await;
    pipeline.wait_for_stop().await?;
    info!(
        committed_through = source.committed_through(),
        "blockpipe stopped"
    );
    match source.take_read_error() {
        Some(e) => Err(Error::Input(e)),
        None => Ok(()),
    }
}

/// Run until `shutdown` resolves, the pipeline stops itself, or the input ended and everything
/// read from it was persisted.
async fn run_until<F>(pipeline: &Pipeline<Line, Value>, source: &LineSource, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    tokio::select! {
        _ = shutdown => {
            info!("shutdown requested, unpersisted records will be delivered again");
        }
        _ = async {
            source.wait_for_eof().await;
            drain(pipeline).await;
        } => {}
        _ = pipeline.wait_for_stop() => {}
    }
}

/// Seal the remaining input and wait until every block is persisted, or the pipeline stopped.
async fn drain(pipeline: &Pipeline<Line, Value>) {
    if let Some(block_id) = pipeline.force_seal().await {
        info!(%block_id, "sealed the final block");
    }
    while pipeline.registered_blocks() > 0 {
        if pipeline.is_stopped() {
            warn!("pipeline stopped before the input was drained");
            return;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
