//! Ingest and flush loop
//! Reads NDJSON spans, batches them into the buffer and writes ready segments as NDJSON

use bytes::Bytes;
use serde::Serialize;
use span_buffer::{
    FlushedSegment, FlushedSegments, IngestReport, MemoryStore, SegmentKey, Span, SpanBuffer, Timestamp,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics;

/// One flushed segment as written to the output stream
#[derive(Debug, Serialize)]
struct SegmentRecord<'a> {
    project_id: u64,
    trace_id: &'a str,
    segment_id: &'a str,
    deadline: Timestamp,
    spans: Vec<serde_json::Value>,
}

impl<'a> SegmentRecord<'a> {
    fn new(key: &'a SegmentKey, segment: &FlushedSegment) -> Self {
        let spans = segment
            .spans
            .iter()
            .map(|payload| {
                serde_json::from_slice(payload)
                    .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
            })
            .collect();
        Self {
            project_id: key.project_id,
            trace_id: &key.trace_id,
            segment_id: &key.anchor_span_id,
            deadline: segment.deadline,
            spans,
        }
    }
}

/// Feeds decoded spans into a [`SpanBuffer`] and hands flushed segments to `output`.
pub struct SpanWorker<W> {
    buffer: Arc<SpanBuffer>,
    output: W,
    pending: Vec<Span>,
    batch_size: usize,
}

impl<W: AsyncWrite + Unpin> SpanWorker<W> {
    pub fn new(buffer: Arc<SpanBuffer>, output: W, batch_size: usize) -> Self {
        Self {
            buffer,
            output,
            pending: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Decode one input line and write the batch once it is full
    pub async fn push_line(&mut self, line: &str, now: Timestamp) -> Result<(), anyhow::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        match Span::from_json(Bytes::copy_from_slice(line.as_bytes())) {
            Ok(span) => self.pending.push(span),
            Err(e) => {
                warn!("dropping undecodable span: {}", e);
                span_buffer::metrics::SPANS_REJECTED.inc();
                return Ok(());
            }
        }

        if self.pending.len() >= self.batch_size {
            self.write_pending(now).await?;
        }
        Ok(())
    }

    /// Write the pending batch. On failure the batch is kept for the next attempt.
    pub async fn write_pending(&mut self, now: Timestamp) -> Result<IngestReport, anyhow::Error> {
        if self.pending.is_empty() {
            return Ok(IngestReport::default());
        }
        let report = self.buffer.process_spans(&self.pending, now).await?;
        self.pending.clear();
        Ok(report)
    }

    /// Flush ready segments, write them out, then acknowledge them.
    ///
    /// Segments are only acknowledged after the output was flushed, so a crash
    /// in between delivers them again instead of losing them.
    pub async fn flush(&mut self, now: Timestamp) -> Result<usize, anyhow::Error> {
        let flushed = self.buffer.flush_segments(now).await?;
        if flushed.is_empty() {
            return Ok(0);
        }

        self.write_segments(&flushed).await?;
        let released = self.buffer.done_flush_segments(&flushed).await?;
        debug!(flushed = flushed.len(), released, "segments handed off");
        Ok(flushed.len())
    }

    /// Flush until no segment with a deadline at or before `now` is left
    pub async fn drain(&mut self, now: Timestamp) -> Result<usize, anyhow::Error> {
        let mut total = 0;
        loop {
            let flushed = self.flush(now).await?;
            if flushed == 0 {
                return Ok(total);
            }
            total += flushed;
        }
    }

    async fn write_segments(&mut self, flushed: &FlushedSegments) -> Result<(), anyhow::Error> {
        for (key, segment) in flushed {
            let mut line = serde_json::to_vec(&SegmentRecord::new(key, segment))?;
            line.push(b'\n');
            self.output.write_all(&line).await?;
        }
        self.output.flush().await?;
        Ok(())
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    if config.metrics.enabled {
        let conf = config.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(conf.host, conf.port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let store = Arc::new(MemoryStore::new());
    let buffer = Arc::new(SpanBuffer::new(store, config.buffer.clone())?);
    let mut worker = SpanWorker::new(buffer, tokio::io::stdout(), config.worker.batch_size);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.worker.flush_interval());
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        shards = config.buffer.num_shards,
        short_linger = config.buffer.short_linger_secs,
        long_linger = config.buffer.long_linger_secs,
        "span buffer worker started"
    );

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = worker.push_line(&line, unix_now()).await {
                        warn!("batch write failed, keeping it for the next tick: {}", e);
                    }
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
            _ = ticker.tick() => {
                let now = unix_now();
                if let Err(e) = worker.write_pending(now).await {
                    warn!("batch write failed, keeping it for the next tick: {}", e);
                }
                if let Err(e) = worker.flush(now).await {
                    warn!("flush failed, segments stay buffered: {}", e);
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Every open segment is past its deadline once the long linger elapsed.
    let now = unix_now();
    worker.write_pending(now).await?;
    let drained = worker
        .drain(now.saturating_add(config.buffer.long_linger_secs))
        .await?;
    info!(segments = drained, "drained buffer on shutdown");
    Ok(())
}
