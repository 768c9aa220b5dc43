//! Segment buffer for tracing spans.
//!
//! Spans arrive one at a time, out of order and from many producers. The
//! buffer groups them by `(project_id, trace_id, anchor span)` inside a
//! key-value store and hands a group back once its debounce deadline passed.
//! All state lives in the store, so any number of ingesters and flushers can
//! share one buffer.

pub mod buffer;
pub mod config;
pub mod index;
pub mod keys;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod types;

pub use buffer::{FlushedSegment, FlushedSegments, IngestReport, SpanBuffer};
pub use config::BufferConfig;
pub use store::memory::MemoryStore;
pub use store::{KeyValueStore, StoreError};
pub use types::{SegmentKey, Span, Timestamp};

use thiserror::Error;

/// Core error type for buffer operations
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Store Error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid Span: {0}")]
    InvalidSpan(String),
    #[error("Corrupt Key: {0}")]
    CorruptKey(String),
    #[error("Config Error: {0}")]
    Config(String),
    #[error("Decode Error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;
