//! Storage key layout
//!
//! - `span-buf:s:{<project_id>:<trace_id>}:<anchor>` member set of one segment
//! - `span-buf:q:<shard>` deadline queue, member = segment key, score = deadline
//!
//! The braces form a Redis Cluster hash tag, so every segment of a trace in a
//! project lands on the same node.

use crate::types::SegmentKey;
use crate::{BufferError, Result};

const SEGMENT_PREFIX: &str = "span-buf:s:";
const QUEUE_PREFIX: &str = "span-buf:q:";

/// Member set key of a segment
pub fn segment_key(segment: &SegmentKey) -> String {
    format!(
        "{}{{{}:{}}}:{}",
        SEGMENT_PREFIX, segment.project_id, segment.trace_id, segment.anchor_span_id
    )
}

/// Inverse of [`segment_key`]
pub fn parse_segment_key(key: &str) -> Result<SegmentKey> {
    let corrupt = || BufferError::CorruptKey(key.to_string());

    let rest = key
        .strip_prefix(SEGMENT_PREFIX)
        .and_then(|rest| rest.strip_prefix('{'))
        .ok_or_else(corrupt)?;
    let (tag, anchor) = rest.split_once("}:").ok_or_else(corrupt)?;
    let (project_id, trace_id) = tag.split_once(':').ok_or_else(corrupt)?;
    let project_id = project_id.parse::<u64>().map_err(|_| corrupt())?;

    if trace_id.is_empty() || anchor.is_empty() {
        return Err(corrupt());
    }
    Ok(SegmentKey::new(project_id, trace_id, anchor))
}

/// Deadline queue key of a shard
pub fn queue_key(shard: u32) -> String {
    format!("{}{}", QUEUE_PREFIX, shard)
}

/// Shard owning every segment of `trace_id`
pub fn shard_for(trace_id: &str, num_shards: u32) -> u32 {
    crc32fast::hash(trace_id.as_bytes()) % num_shards.max(1)
}
