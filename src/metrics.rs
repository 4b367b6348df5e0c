//! The metrics surface of the listener.
//!
//! Metrics are emitted through an injected [`MetricsSink`] rather than
//! directly against a global registry, so tests (and embedders with their
//! own telemetry pipeline) can substitute a recording or no-op sink.
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Name of the counter tracking consumed messages, labeled `(queue, status)`.
pub const CONSUME_TOTAL: &str = "mq_consume_total";
/// Name of the histogram tracking processing duration, labeled `(queue)`.
pub const CONSUME_DURATION_SECONDS: &str = "mq_consume_duration_seconds";

/// Destination for the per-message telemetry recorded by the
/// [`Metrics`](crate::interceptors::Metrics) interceptor.
pub trait MetricsSink: Send + Sync + 'static {
    /// Record the outcome and duration of one message consumption.
    fn record_consume(&self, queue_name: &str, success: bool, duration: Duration);
}

/// The default sink: forwards to the global recorder installed via the
/// `metrics` crate (e.g. a Prometheus exporter).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn record_consume(&self, queue_name: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "fail" };
        counter!(CONSUME_TOTAL, "queue" => queue_name.to_owned(), "status" => status).increment(1);
        histogram!(CONSUME_DURATION_SECONDS, "queue" => queue_name.to_owned())
            .record(duration.as_secs_f64());
    }
}

/// A sink that drops everything. Useful when embedders have no recorder
/// installed and want to silence the default one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl MetricsSink for NoOpSink {
    fn record_consume(&self, _queue_name: &str, _success: bool, _duration: Duration) {}
}

/// Register help texts for the metrics emitted by [`RecorderSink`] with the
/// global recorder. Call once at startup, after installing the recorder.
pub fn describe() {
    describe_counter!(CONSUME_TOTAL, "Total number of consumed RabbitMQ messages");
    describe_histogram!(
        CONSUME_DURATION_SECONDS,
        "Time spent processing a RabbitMQ message, in seconds"
    );
}
