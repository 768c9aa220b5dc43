use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

lazy_static::lazy_static! {
    pub static ref SPANS_INGESTED: IntCounter = register_int_counter!(
        "span_buffer_spans_ingested_total",
        "Spans written into a segment"
    ).expect("span_buffer_spans_ingested_total registers once");

    pub static ref SPANS_REJECTED: IntCounter = register_int_counter!(
        "span_buffer_spans_rejected_total",
        "Spans skipped because of malformed identifiers"
    ).expect("span_buffer_spans_rejected_total registers once");

    pub static ref SEGMENTS_FLUSHED: IntCounter = register_int_counter!(
        "span_buffer_segments_flushed_total",
        "Segments returned by flush, including repeated deliveries"
    ).expect("span_buffer_segments_flushed_total registers once");

    pub static ref SEGMENTS_RELEASED: IntCounter = register_int_counter!(
        "span_buffer_segments_released_total",
        "Segments deleted after acknowledgment"
    ).expect("span_buffer_segments_released_total registers once");

    pub static ref STALE_QUEUE_ENTRIES: IntCounter = register_int_counter!(
        "span_buffer_stale_queue_entries_total",
        "Queue entries dropped because their segment had already expired"
    ).expect("span_buffer_stale_queue_entries_total registers once");

    pub static ref EXPIRED_KEYS: IntCounter = register_int_counter!(
        "span_buffer_expired_keys_total",
        "Keys purged from the in-process store after their TTL elapsed"
    ).expect("span_buffer_expired_keys_total registers once");

    pub static ref SEGMENT_SPANS: Histogram = register_histogram!(
        "span_buffer_segment_spans",
        "Number of spans in a flushed segment",
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    ).expect("span_buffer_segment_spans registers once");
}
