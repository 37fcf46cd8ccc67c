//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for plan and step execution
//! with standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all fedq metrics
pub const METRICS_PREFIX: &str = "fedq";

/// Histogram buckets for step latency (in seconds)
pub const STEP_BUCKETS: &[f64] = &[
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s - bottleneck threshold
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Plan metrics
    describe_counter!(
        format!("{}_plans_total", METRICS_PREFIX),
        Unit::Count,
        "Total plans executed, by outcome"
    );

    describe_histogram!(
        format!("{}_plan_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Plan execution latency in seconds"
    );

    // Step metrics
    describe_counter!(
        format!("{}_steps_total", METRICS_PREFIX),
        Unit::Count,
        "Total steps finished, by backend and outcome"
    );

    describe_histogram!(
        format!("{}_step_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Step latency in seconds"
    );

    describe_counter!(
        format!("{}_step_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Total retried adapter calls"
    );

    describe_counter!(
        format!("{}_rows_produced_total", METRICS_PREFIX),
        Unit::Count,
        "Total rows produced by steps"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record a finished plan
pub fn record_plan(duration_secs: f64, outcome: &str) {
    counter!(
        format!("{}_plans_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_plan_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// Helper to record a finished step
pub fn record_step(duration_secs: f64, backend: &str, outcome: &str, attempts: u32, rows: usize) {
    counter!(
        format!("{}_steps_total", METRICS_PREFIX),
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_step_duration_seconds", METRICS_PREFIX),
        "backend" => backend.to_string()
    )
    .record(duration_secs);

    if attempts > 1 {
        counter!(
            format!("{}_step_retries_total", METRICS_PREFIX),
            "backend" => backend.to_string()
        )
        .increment(u64::from(attempts - 1));
    }

    counter!(
        format!("{}_rows_produced_total", METRICS_PREFIX),
        "backend" => backend.to_string()
    )
    .increment(rows as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_buckets() {
        let mut prev = 0.0;
        for &bucket in STEP_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        // Bottleneck threshold should be a bucket edge
        assert!(STEP_BUCKETS.contains(&1.0));
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls are no-ops
        let metrics = RequestMetrics::start("POST", "/v1/plans/execute");
        metrics.finish(200);
        record_plan(0.2, "succeeded");
        record_step(0.1, "mongodb", "retried", 3, 10);
    }
}
