//! Span buffer
//! Ingest path (`process_spans`) and two-phase drain (`flush_segments`, `done_flush_segments`)

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;
use crate::index::SegmentIndex;
use crate::keys;
use crate::metrics;
use crate::scheduler::DeadlineScheduler;
use crate::store::{KeyValueStore, Pipeline, Reply, StoreError};
use crate::types::{SegmentKey, Span, Timestamp};
use crate::Result;

/// Outcome of one `process_spans` call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
}

/// A ready segment as seen by one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedSegment {
    /// Deadline the segment had when it was read; acknowledgment is checked against it
    pub deadline: Timestamp,
    pub spans: BTreeSet<Bytes>,
}

pub type FlushedSegments = BTreeMap<SegmentKey, FlushedSegment>;

/// Groups spans into segments inside a shared [`KeyValueStore`].
///
/// The buffer keeps no state of its own; any number of instances may share a
/// store.
pub struct SpanBuffer {
    store: Arc<dyn KeyValueStore>,
    config: BufferConfig,
    index: SegmentIndex,
    scheduler: DeadlineScheduler,
}

impl SpanBuffer {
    pub fn new(store: Arc<dyn KeyValueStore>, config: BufferConfig) -> Result<Self> {
        config.validate()?;
        let ttl = config.segment_ttl();
        Ok(Self {
            store,
            index: SegmentIndex::new(ttl),
            scheduler: DeadlineScheduler::new(config.short_linger(), config.long_linger(), ttl),
            config,
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.config.num_shards
    }

    /// Write a batch of spans at `now`.
    ///
    /// Spans are applied in order in one atomic pipeline. Malformed spans are
    /// skipped and counted. A store failure fails the whole batch; replaying it
    /// is safe because every write is idempotent.
    pub async fn process_spans(&self, spans: &[Span], now: Timestamp) -> Result<IngestReport> {
        let mut pipeline = Pipeline::new(now);
        let mut report = IngestReport::default();
        let mut shards = BTreeSet::new();

        for span in spans {
            if let Err(e) = span.validate() {
                warn!(project_id = span.project_id, "skipping span: {}", e);
                report.rejected += 1;
                continue;
            }

            let segment = SegmentIndex::segment_for(span);
            let set_key = SegmentIndex::storage_key(&segment);
            let shard = keys::shard_for(&segment.trace_id, self.config.num_shards);
            let deadline = self.scheduler.deadline_for(span.is_root(), now);

            self.index.add_member(&mut pipeline, &set_key, span.payload.clone());
            self.scheduler.rearm(&mut pipeline, shard, &set_key, deadline);
            shards.insert(shard);
            report.accepted += 1;
        }

        for shard in shards {
            self.scheduler.refresh_ttl(&mut pipeline, shard);
        }

        if !pipeline.is_empty() {
            self.store.execute(pipeline).await?;
        }

        metrics::SPANS_INGESTED.inc_by(report.accepted as u64);
        metrics::SPANS_REJECTED.inc_by(report.rejected as u64);
        debug!(
            accepted = report.accepted,
            rejected = report.rejected,
            now,
            "processed span batch"
        );
        Ok(report)
    }

    /// Segments whose deadline is at or before `now`, across all shards.
    ///
    /// Each shard contributes at most `max_flush_segments` segments, so the
    /// result may be partial. Callers acknowledge what they got and call again
    /// until nothing is returned.
    ///
    /// Nothing is deleted: a segment keeps being returned until it is passed
    /// to [`SpanBuffer::done_flush_segments`].
    pub async fn flush_segments(&self, now: Timestamp) -> Result<FlushedSegments> {
        let mut flushed = FlushedSegments::new();
        for shard in 0..self.config.num_shards {
            flushed.extend(self.flush_shard(shard, now).await?);
        }
        if !flushed.is_empty() {
            info!(segments = flushed.len(), now, "flushing ready segments");
        }
        Ok(flushed)
    }

    /// Ready segments of a single shard, at most `max_flush_segments` of them
    pub async fn flush_shard(&self, shard: u32, now: Timestamp) -> Result<FlushedSegments> {
        let mut pipeline = Pipeline::new(now);
        self.scheduler
            .ready(&mut pipeline, shard, now, self.config.max_flush_segments);
        let ready = first_reply(self.store.execute(pipeline).await?)?.into_scored()?;
        if ready.is_empty() {
            return Ok(FlushedSegments::new());
        }

        let mut pipeline = Pipeline::new(now);
        for (set_key, _) in &ready {
            self.index.read_members(&mut pipeline, set_key);
        }
        let replies = self.store.execute(pipeline).await?;

        let mut flushed = FlushedSegments::new();
        let mut stale = Vec::new();
        let mut unreadable = Vec::new();
        for ((set_key, deadline), reply) in ready.into_iter().zip(replies) {
            let spans = reply.into_members()?;
            if spans.is_empty() {
                // The member set expired before anyone flushed it.
                stale.push((set_key, deadline));
                continue;
            }
            match keys::parse_segment_key(&set_key) {
                Ok(segment) => {
                    metrics::SEGMENT_SPANS.observe(spans.len() as f64);
                    flushed.insert(
                        segment,
                        FlushedSegment {
                            deadline,
                            spans: spans.into_iter().collect(),
                        },
                    );
                }
                Err(e) => {
                    warn!(shard, "dropping unreadable queue entry: {}", e);
                    unreadable.push(set_key);
                }
            }
        }

        if !stale.is_empty() || !unreadable.is_empty() {
            let mut pipeline = Pipeline::new(now);
            for (set_key, deadline) in &stale {
                // Guarded, in case a concurrent write just recreated the segment
                self.scheduler.release(&mut pipeline, shard, set_key, *deadline, 0);
            }
            for set_key in &unreadable {
                self.scheduler.discard(&mut pipeline, shard, set_key);
            }
            self.store.execute(pipeline).await?;
            let count = stale.len() + unreadable.len();
            metrics::STALE_QUEUE_ENTRIES.inc_by(count as u64);
            warn!(shard, count, "removed stale queue entries");
        }

        metrics::SEGMENTS_FLUSHED.inc_by(flushed.len() as u64);
        Ok(flushed)
    }

    /// Delete the state of segments the caller has taken ownership of.
    ///
    /// Each segment is released in its own atomic step, so a failure leaves
    /// the remaining segments untouched and the call can be retried. Unknown
    /// or already released segments are ignored. A segment that received a
    /// span after it was flushed is kept and flushed again later, even when
    /// that write left its deadline unchanged.
    ///
    /// Returns the number of segments actually deleted.
    pub async fn done_flush_segments(&self, claimed: &FlushedSegments) -> Result<usize> {
        let mut released = 0;
        for (segment, flushed) in claimed {
            let set_key = SegmentIndex::storage_key(segment);
            let shard = keys::shard_for(&segment.trace_id, self.config.num_shards);

            // The release script compares against the stored segment, so `now`
            // only matters for expiry bookkeeping.
            let mut pipeline = Pipeline::new(flushed.deadline);
            self.scheduler.release(
                &mut pipeline,
                shard,
                &set_key,
                flushed.deadline,
                flushed.spans.len(),
            );
            let reply = first_reply(self.store.execute(pipeline).await?)?.into_integer()?;

            if reply == 1 {
                released += 1;
            } else {
                debug!(%segment, "segment changed since flush, keeping it");
            }
        }
        metrics::SEGMENTS_RELEASED.inc_by(released as u64);
        Ok(released)
    }
}

fn first_reply(replies: Vec<Reply>) -> std::result::Result<Reply, StoreError> {
    replies.into_iter().next().ok_or(StoreError::UnexpectedReply {
        expected: "one reply",
        got: "none".to_string(),
    })
}
