//! Segment index
//! Maps spans to segments and owns the member sets

use bytes::Bytes;
use std::time::Duration;

use crate::keys;
use crate::store::Pipeline;
use crate::types::{SegmentKey, Span};

/// Writes and reads the member set of each segment.
///
/// Grouping is by direct parent only: a child joins the segment named by its
/// `parent_span_id`, a root joins the segment named by its own id. Segments
/// never span projects.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    ttl: Duration,
}

impl SegmentIndex {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn segment_for(span: &Span) -> SegmentKey {
        SegmentKey::new(span.project_id, span.trace_id.clone(), span.anchor())
    }

    /// Queue the commands adding `payload` to a segment and refreshing its TTL
    pub fn add_member(&self, pipeline: &mut Pipeline, set_key: &str, payload: Bytes) {
        pipeline.sadd(set_key, payload).expire(set_key, self.ttl);
    }

    pub fn read_members(&self, pipeline: &mut Pipeline, set_key: &str) {
        pipeline.smembers(set_key);
    }

    pub fn storage_key(segment: &SegmentKey) -> String {
        keys::segment_key(segment)
    }
}
