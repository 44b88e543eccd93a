//! Metric instrument factories for weather-worker.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"weather-worker"` meter;
//! without an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for weather-worker instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("weather-worker")
}

/// Counter: deliveries received from the broker.
/// Labels: `queue`.
pub fn deliveries_received() -> Counter<u64> {
    meter()
        .u64_counter("worker.deliveries.received")
        .with_description("Number of deliveries received")
        .build()
}

/// Counter: deliveries settled with the broker.
/// Labels: `queue`, `outcome` ("acked" | "ack_failed" | "rejected" | "reject_failed").
pub fn deliveries_settled() -> Counter<u64> {
    meter()
        .u64_counter("worker.deliveries.settled")
        .with_description("Number of deliveries settled, by outcome")
        .build()
}

/// Histogram: processor duration per delivery in milliseconds.
/// Labels: `queue`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("worker.processing.duration_ms")
        .with_description("Delivery processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: fatal startup failures.
/// Labels: `stage`.
pub fn startup_failures() -> Counter<u64> {
    meter()
        .u64_counter("worker.startup.failures")
        .with_description("Number of fatal worker startup failures")
        .build()
}

/// Counter: attempts made under a retry policy.
/// Labels: `operation`, `result` ("ok" | "error").
pub fn retry_attempts() -> Counter<u64> {
    meter()
        .u64_counter("worker.retry.attempts")
        .with_description("Number of attempts made under a retry policy")
        .build()
}
