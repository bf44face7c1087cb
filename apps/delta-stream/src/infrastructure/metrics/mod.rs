//! Prometheus Metrics Module
//!
//! Exposes delta streaming metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Connections**: open viewer connections and active subscriptions
//! - **Polling**: ticks, tick latency, rows fetched and failed queries per source
//! - **Transport**: delta messages sent and teardown reasons
//! - **Protocol**: rejected client requests
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connection gauges
    describe_gauge!(
        "delta_stream_connections",
        "Number of open viewer connections"
    );
    describe_gauge!(
        "delta_stream_subscriptions",
        "Number of connections with an active subscription"
    );

    // Polling
    describe_counter!("delta_stream_ticks_total", "Total poll ticks executed");
    describe_histogram!(
        "delta_stream_tick_duration_seconds",
        "Time to query every source for one tick"
    );
    describe_counter!(
        "delta_stream_rows_fetched_total",
        "Rows fetched by source"
    );
    describe_counter!(
        "delta_stream_source_failures_total",
        "Failed source queries by source and kind"
    );

    // Transport
    describe_counter!(
        "delta_stream_messages_sent_total",
        "Delta messages queued to viewers"
    );
    describe_counter!(
        "delta_stream_transport_failures_total",
        "Connection teardowns caused by send failures, by reason"
    );

    // Protocol
    describe_counter!(
        "delta_stream_rejected_requests_total",
        "Client requests answered with a rejection, by error code"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Update the open connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(count: usize) {
    gauge!("delta_stream_connections").set(count as f64);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("delta_stream_subscriptions").set(count as f64);
}

/// Record a completed poll tick.
pub fn record_tick(duration: Duration) {
    counter!("delta_stream_ticks_total").increment(1);
    histogram!("delta_stream_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record rows fetched for a source.
pub fn record_rows_fetched(source: &'static str, rows: usize) {
    counter!("delta_stream_rows_fetched_total", "source" => source).increment(rows as u64);
}

/// Record a failed source query.
pub fn record_source_failure(source: &'static str, kind: &'static str) {
    counter!(
        "delta_stream_source_failures_total",
        "source" => source,
        "kind" => kind
    )
    .increment(1);
}

/// Record a delta message queued to a viewer.
pub fn record_message_sent() {
    counter!("delta_stream_messages_sent_total").increment(1);
}

/// Record a connection torn down by a send failure.
pub fn record_transport_failure(reason: &'static str) {
    counter!("delta_stream_transport_failures_total", "reason" => reason).increment(1);
}

/// Record a rejected client request.
pub fn record_rejected_request(code: &'static str) {
    counter!("delta_stream_rejected_requests_total", "code" => code).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_functions_accept_labels() {
        set_connections(3);
        set_subscriptions(2);
        record_tick(Duration::from_millis(12));
        record_rows_fetched("price", 4);
        record_source_failure("funding_data", "query");
        record_message_sent();
        record_transport_failure("slow_consumer");
        record_rejected_request("malformed_json");
    }

    #[test]
    fn init_is_idempotent() {
        let first = init_metrics().unwrap();
        record_rows_fetched("price", 2);
        let second = init_metrics().unwrap();

        assert!(get_metrics_handle().is_some());
        assert!(second.render().contains("delta_stream_rows_fetched_total"));
        drop(first);
    }
}
