//! A [`RecordSource`] reading newline-delimited records from a file or stdin.

use std::{collections::BTreeSet, io, path::PathBuf, str::Utf8Error, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use blockpipe_id::RecordKey;
use blockpipe_pipeline::{Acknowledge, DynError, RecordSource, SourceHandle};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Read from stdin instead of a file.
pub(crate) const STDIN: &str = "-";

/// A single input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    pub(crate) number: u64,
    pub(crate) text: String,
}

/// Key a line is delivered under.
pub(crate) fn line_key(consumer_id: &str, number: u64) -> RecordKey {
    RecordKey::from(format!("{consumer_id}:{number}"))
}

fn line_number(key: &RecordKey) -> Option<u64> {
    key.as_str().rsplit_once(':')?.1.parse().ok()
}

/// Reported through the source side-channel for a line that is not valid UTF-8. The line is
/// still delivered, with the invalid bytes replaced.
#[derive(Debug, Error)]
#[error("line {number} is not valid UTF-8")]
struct InvalidLine {
    number: u64,
    #[source]
    source: Utf8Error,
}

/// Strip a trailing `\n` or `\r\n`.
fn trim_line_end(bytes: &[u8]) -> &[u8] {
    match bytes.strip_suffix(b"\n") {
        Some(line) => line.strip_suffix(b"\r").unwrap_or(line),
        None => bytes,
    }
}

#[derive(Debug)]
pub(crate) struct LineSource {
    input: String,
    consumer_id: String,
    watermark: Arc<Watermark>,
    eof: CancellationToken,
    cancel: CancellationToken,
    read_error: Arc<Mutex<Option<io::Error>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LineSource {
    /// A source reading `input`, a file path or [`STDIN`].
    pub(crate) fn new(input: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            consumer_id: consumer_id.into(),
            watermark: Default::default(),
            eof: CancellationToken::new(),
            cancel: CancellationToken::new(),
            read_error: Default::default(),
            reader: Mutex::new(None),
        }
    }

    /// Resolves once every input line was delivered, or delivery was aborted.
    ///
    /// Delivery is only aborted by the source being closed or by reading the input failing, see
    /// [`take_read_error`][Self::take_read_error].
    pub(crate) async fn wait_for_eof(&self) {
        self.eof.cancelled().await;
    }

    /// The error that stopped reading the input before its end, if any.
    pub(crate) fn take_read_error(&self) -> Option<io::Error> {
        self.read_error.lock().take()
    }

    /// Highest line number up to which every line has been acknowledged.
    pub(crate) fn committed_through(&self) -> u64 {
        self.watermark.committed_through()
    }

    async fn open(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        if self.input == STDIN {
            return Ok(Box::new(tokio::io::stdin()));
        }
        let path = PathBuf::from(&self.input);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening source input {}", path.display()))?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl RecordSource<Line> for LineSource {
    async fn start(&self, handle: SourceHandle<Line>) -> Result<(), DynError> {
        let reader = BufReader::new(self.open().await?);
        info!(input = %self.input, consumer_id = %self.consumer_id, "line source connected");

        let task = tokio::spawn(deliver(
            reader,
            self.consumer_id.clone(),
            handle,
            self.cancel.clone(),
            self.eof.clone(),
            Arc::clone(&self.read_error),
        ));
        *self.reader.lock() = Some(task);
        Ok(())
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledge> {
        Arc::clone(&self.watermark) as _
    }

    async fn close(&self) {
        self.cancel.cancel();
        let task = self.reader.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "line source reader task failed");
            }
        }
        info!(
            committed_through = self.watermark.committed_through(),
            "line source closed"
        );
    }
}

async fn deliver<R>(
    mut reader: BufReader<R>,
    consumer_id: String,
    handle: SourceHandle<Line>,
    cancel: CancellationToken,
    eof: CancellationToken,
    read_error: Arc<Mutex<Option<io::Error>>>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = Vec::new();
    let mut number = 0;
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!(lines = number, "line source reached end of input");
                break;
            }
            Ok(_) => {
                number += 1;
                let bytes = trim_line_end(&buf);
                let text = match std::str::from_utf8(bytes) {
                    Ok(text) => text.to_owned(),
                    Err(source) => {
                        handle.report_error(InvalidLine { number, source });
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                };
                let line = Line { number, text };
                if handle.push(line_key(&consumer_id, number), line).is_err() {
                    debug!(number, "pipeline closed, line source stops delivering");
                    break;
                }
            }
            Err(e) => {
                handle.report_error(format!("reading source input failed: {e}"));
                *read_error.lock() = Some(e);
                break;
            }
        }
    }
    eof.cancel();
}

/// Tracks which lines were acknowledged and the contiguous prefix committed so far.
#[derive(Debug, Default)]
pub(crate) struct Watermark {
    state: Mutex<WatermarkState>,
}

#[derive(Debug, Default)]
struct WatermarkState {
    committed_through: u64,
    ahead: BTreeSet<u64>,
}

impl Watermark {
    pub(crate) fn committed_through(&self) -> u64 {
        self.state.lock().committed_through
    }

    fn advance(&self, number: u64) -> Option<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if number <= state.committed_through || !state.ahead.insert(number) {
            return None;
        }
        let before = state.committed_through;
        while state.ahead.remove(&(state.committed_through + 1)) {
            state.committed_through += 1;
        }
        (state.committed_through > before).then_some(state.committed_through)
    }
}

#[async_trait]
impl Acknowledge for Watermark {
    async fn acknowledge(&self, key: &RecordKey) -> Result<(), DynError> {
        let number =
            line_number(key).ok_or_else(|| format!("not a line source record key: {key}"))?;
        if let Some(through) = self.advance(number) {
            debug!(committed_through = through, "line source watermark advanced");
        }
        Ok(())
    }
}
