use metric::{Metric, Registry, U64Counter};

pub(crate) const RECORDS_APPENDED_METRIC_NAME: &str = "blockpipe_records_appended";
pub(crate) const BLOCKS_SEALED_METRIC_NAME: &str = "blockpipe_blocks_sealed";
pub(crate) const BLOCKS_COMMITTED_METRIC_NAME: &str = "blockpipe_blocks_committed";
pub(crate) const WRITE_RETRIES_METRIC_NAME: &str = "blockpipe_write_retries";
pub(crate) const ACK_FAILURES_METRIC_NAME: &str = "blockpipe_ack_failures";
pub(crate) const SOURCE_ERRORS_METRIC_NAME: &str = "blockpipe_source_errors";

#[derive(Debug)]
pub(crate) struct PipelineMetrics {
    pub(crate) records_appended: U64Counter,
    pub(crate) blocks_sealed: U64Counter,
    pub(crate) blocks_committed: U64Counter,
    pub(crate) write_retries: U64Counter,
    pub(crate) ack_failures: U64Counter,
    pub(crate) source_errors: U64Counter,
}

impl PipelineMetrics {
    pub(crate) fn new(metric_registry: &Registry) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            let metric: Metric<U64Counter> = metric_registry.register_metric(name, description);
            metric.recorder([])
        };

        Self {
            records_appended: counter(
                RECORDS_APPENDED_METRIC_NAME,
                "records pushed by the source into the block accumulator",
            ),
            blocks_sealed: counter(
                BLOCKS_SEALED_METRIC_NAME,
                "non-empty blocks sealed and registered for persistence",
            ),
            blocks_committed: counter(
                BLOCKS_COMMITTED_METRIC_NAME,
                "blocks written to the sink and acknowledged at the source",
            ),
            write_retries: counter(
                WRITE_RETRIES_METRIC_NAME,
                "block writes that failed and were retried",
            ),
            ack_failures: counter(
                ACK_FAILURES_METRIC_NAME,
                "record acknowledgments rejected by the source",
            ),
            source_errors: counter(
                SOURCE_ERRORS_METRIC_NAME,
                "errors reported through the source side-channel",
            ),
        }
    }
}
