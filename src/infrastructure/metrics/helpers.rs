//! Prometheus backed `MetricsCollector`

use prometheus::{Encoder, TextEncoder};

use crate::domain::message::MessageContext;

use super::{
    names, tag, MetricsCollector, BUFFER_OVERFLOW_TOTAL, CONNECTION_USAGE,
    MESSAGES_DUPLICATE_TOTAL, MESSAGES_RECEIVED_TOTAL, MESSAGES_SENT_TOTAL, POOL_RECONNECTIONS_TOTAL,
    POOL_SIZE, PROCESSING_FAILED_TOTAL, PROCESSING_LATENCY, REQUEST_TIMEOUTS_TOTAL,
    TAG_MESSAGE_TYPE,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Maps queue metric names onto the registered Prometheus series
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricsCollector;

impl PrometheusMetricsCollector {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsCollector for PrometheusMetricsCollector {
    fn meter(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
        context: Option<&MessageContext>,
    ) {
        let message_type = tag(tags, TAG_MESSAGE_TYPE);
        let count = value.max(0.0) as u64;

        match name {
            names::MESSAGES_SENT => MESSAGES_SENT_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::MESSAGES_RECEIVED => MESSAGES_RECEIVED_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::DUPLICATES => MESSAGES_DUPLICATE_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::BUFFER_OVERFLOWS => BUFFER_OVERFLOW_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::PROCESSING_FAILURES => PROCESSING_FAILED_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::REQUEST_TIMEOUTS => REQUEST_TIMEOUTS_TOTAL
                .with_label_values(&[message_type])
                .inc_by(count),
            names::RECONNECTIONS => POOL_RECONNECTIONS_TOTAL.inc_by(count),
            other => {
                tracing::trace!(metric = other, "Unmapped counter");
                return;
            }
        }

        if let Some(context) = context {
            tracing::trace!(metric = name, message_id = %context.message_id(), "Counter recorded");
        }
    }

    fn histogram(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
        _context: Option<&MessageContext>,
    ) {
        match name {
            names::PROCESSING_LATENCY => PROCESSING_LATENCY
                .with_label_values(&[tag(tags, TAG_MESSAGE_TYPE)])
                .observe(value),
            names::CONNECTION_USAGE => CONNECTION_USAGE.observe(value),
            names::POOL_SIZE => POOL_SIZE.set(value as i64),
            other => tracing::trace!(metric = other, "Unmapped histogram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_message_type() {
        let collector = PrometheusMetricsCollector::new();
        let before = MESSAGES_SENT_TOTAL.with_label_values(&["HelpersTest"]).get();

        collector.meter(
            names::MESSAGES_SENT,
            2.0,
            &[(TAG_MESSAGE_TYPE, "HelpersTest")],
            None,
        );

        let after = MESSAGES_SENT_TOTAL.with_label_values(&["HelpersTest"]).get();
        assert_eq!(after - before, 2);
    }

    #[test]
    fn test_encode_contains_prefix() {
        let collector = PrometheusMetricsCollector::new();
        collector.histogram(names::POOL_SIZE, 4.0, &[], None);

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_pq_pool_size"));
    }
}
