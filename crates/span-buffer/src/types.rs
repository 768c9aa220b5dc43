use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BufferError, Result};

/// Logical time in seconds. Callers pass it explicitly so replays and tests
/// are deterministic.
pub type Timestamp = u64;

/// A single span as delivered by the transport.
///
/// The payload is opaque to the buffer; only the routing fields are inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub payload: Bytes,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub project_id: u64,
}

/// Routing fields of a JSON encoded span. Everything else stays in the payload.
#[derive(Debug, Deserialize)]
struct SpanEnvelope {
    trace_id: String,
    span_id: String,
    #[serde(default)]
    parent_span_id: Option<String>,
    project_id: u64,
}

impl Span {
    pub fn new(
        project_id: u64,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: Option<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            payload: payload.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id,
            project_id,
        }
    }

    /// Decode the routing fields of a JSON span, keeping the raw bytes as payload.
    pub fn from_json(payload: Bytes) -> Result<Self> {
        let envelope: SpanEnvelope = serde_json::from_slice(&payload)?;
        Ok(Self {
            payload,
            trace_id: envelope.trace_id,
            span_id: envelope.span_id,
            parent_span_id: envelope.parent_span_id,
            project_id: envelope.project_id,
        })
    }

    /// A span without a parent (or with an empty one) closes its segment.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.as_deref().map_or(true, str::is_empty)
    }

    /// Id of the span that names this span's segment.
    pub fn anchor(&self) -> &str {
        match self.parent_span_id.as_deref() {
            Some(parent) if !parent.is_empty() => parent,
            _ => &self.span_id,
        }
    }

    /// Reject ids that cannot be stored under a segment key.
    pub fn validate(&self) -> Result<()> {
        check_id("trace_id", &self.trace_id)?;
        check_id("span_id", &self.span_id)?;
        if let Some(parent) = self.parent_span_id.as_deref() {
            if !parent.is_empty() {
                check_id("parent_span_id", parent)?;
            }
        }
        Ok(())
    }
}

fn check_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BufferError::InvalidSpan(format!("empty {}", field)));
    }
    // Braces delimit the hash tag of a segment key.
    if value.contains(['{', '}']) {
        return Err(BufferError::InvalidSpan(format!(
            "{} contains a reserved character: {:?}",
            field, value
        )));
    }
    Ok(())
}

/// Identity of a segment: one project, one trace, one anchor span.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub project_id: u64,
    pub trace_id: String,
    pub anchor_span_id: String,
}

impl SegmentKey {
    pub fn new(
        project_id: u64,
        trace_id: impl Into<String>,
        anchor_span_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            trace_id: trace_id.into(),
            anchor_span_id: anchor_span_id.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project_id, self.trace_id, self.anchor_span_id)
    }
}
