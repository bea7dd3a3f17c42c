//! Metrics for the persistent queue.
//!
//! The queue core only talks to the `MetricsCollector` trait. This module
//! provides the Prometheus backed collector used by the binary and a no-op
//! collector for embedders that bring no metrics sink.
//!
//! Recorded series:
//! - Message metrics (sent, received, duplicates, overflows, failures)
//! - Latency metrics (per-message processing, connection usage)
//! - Pool metrics (size, reconnections)
//! - Request/reply timeouts

mod helpers;

pub use helpers::{encode_metrics, PrometheusMetricsCollector};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

use crate::domain::message::MessageContext;

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_pq";

/// Metric names passed to `MetricsCollector`
pub mod names {
    /// Counter, one per published envelope
    pub const MESSAGES_SENT: &str = "messages.sent";
    /// Counter, one per envelope accepted into a consumer buffer
    pub const MESSAGES_RECEIVED: &str = "messages.received";
    /// Histogram, callback duration in seconds
    pub const PROCESSING_LATENCY: &str = "processing.latency";
    /// Histogram, current number of pooled connections
    pub const POOL_SIZE: &str = "pool.size";
    /// Histogram, seconds between take and release of a connection
    pub const CONNECTION_USAGE: &str = "connection.usage";
    /// Counter, deliveries dropped because the id was already in flight
    pub const DUPLICATES: &str = "messages.duplicate";
    /// Counter, deliveries rejected by a full buffer
    pub const BUFFER_OVERFLOWS: &str = "buffer.overflow";
    /// Counter, failed callbacks
    pub const PROCESSING_FAILURES: &str = "processing.failed";
    /// Counter, connections replaced by the reconnect loop
    pub const RECONNECTIONS: &str = "pool.reconnections";
    /// Counter, requests that received no reply in time
    pub const REQUEST_TIMEOUTS: &str = "request.timeout";
}

/// Tag carrying the message type of an envelope
pub const TAG_MESSAGE_TYPE: &str = "message_type";

/// Sink for counters and timings emitted by the queue core
pub trait MetricsCollector: Send + Sync + 'static {
    /// Add `value` to a counter
    fn meter(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
        context: Option<&MessageContext>,
    );

    /// Record one observation
    fn histogram(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
        context: Option<&MessageContext>,
    );
}

/// Collector that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn meter(&self, _: &str, _: f64, _: &[(&str, &str)], _: Option<&MessageContext>) {}

    fn histogram(&self, _: &str, _: f64, _: &[(&str, &str)], _: Option<&MessageContext>) {}
}

/// Value of `key` in a tag list, or "unknown"
pub(crate) fn tag<'a>(tags: &[(&'a str, &'a str)], key: &str) -> &'a str {
    tags.iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or("unknown")
}

lazy_static! {
    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Total envelopes published by message type
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total envelopes published",
        &["message_type"]
    ).unwrap();

    /// Total envelopes buffered by consumers
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total envelopes accepted into consumer buffers",
        &["message_type"]
    ).unwrap();

    /// Deliveries dropped because the same id was in flight
    pub static ref MESSAGES_DUPLICATE_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_duplicate_total", METRIC_PREFIX),
        "Deliveries dropped as in-flight duplicates",
        &["message_type"]
    ).unwrap();

    /// Deliveries rejected because the consumer buffer was full
    pub static ref BUFFER_OVERFLOW_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_buffer_overflow_total", METRIC_PREFIX),
        "Deliveries rejected by a full consumer buffer",
        &["message_type"]
    ).unwrap();

    /// Consumer callbacks that failed or panicked
    pub static ref PROCESSING_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_processing_failed_total", METRIC_PREFIX),
        "Consumer callbacks that failed",
        &["message_type"]
    ).unwrap();

    // ============================================================================
    // Latency Metrics
    // ============================================================================

    /// Callback processing latency
    pub static ref PROCESSING_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_processing_latency_seconds", METRIC_PREFIX),
        "Consumer callback latency in seconds",
        &["message_type"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Time a connection spent taken before release
    pub static ref CONNECTION_USAGE: Histogram = register_histogram!(
        format!("{}_connection_usage_seconds", METRIC_PREFIX),
        "Duration a pooled connection was held",
        vec![0.01, 0.1, 1.0, 10.0, 60.0, 600.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Pool Metrics
    // ============================================================================

    /// Connections currently in the pool
    pub static ref POOL_SIZE: IntGauge = register_int_gauge!(
        format!("{}_pool_size", METRIC_PREFIX),
        "Number of pooled broker connections"
    ).unwrap();

    /// Connections replaced after a disconnect
    pub static ref POOL_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_reconnections_total", METRIC_PREFIX),
        "Connections replaced by the reconnect loop"
    ).unwrap();

    // ============================================================================
    // Request/Reply Metrics
    // ============================================================================

    /// Requests that timed out waiting for a reply
    pub static ref REQUEST_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_request_timeouts_total", METRIC_PREFIX),
        "Requests without a reply before the timeout",
        &["message_type"]
    ).unwrap();
}
