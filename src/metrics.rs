//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a batch of proxied embedding calls
pub fn record_embed_batches(batches: usize) {
    metrics::counter!("sidecar_embed_batches_total").increment(batches as u64);
}

/// Record a proxied generation call
pub fn record_generate_request(streaming: bool) {
    let mode = if streaming { "streaming" } else { "blocking" };
    metrics::counter!("sidecar_generate_requests_total", "mode" => mode).increment(1);
}

/// Record a non-success response from the upstream server
pub fn record_upstream_failure(endpoint: &'static str) {
    metrics::counter!("sidecar_upstream_failures_total", "endpoint" => endpoint).increment(1);
}

/// Record a streaming call cancelled by the consumer
pub fn record_stream_cancelled() {
    metrics::counter!("sidecar_streams_cancelled_total").increment(1);
}

/// Update the ready-runner gauge (0 or 1 for a single-process sidecar)
pub fn update_runner_count(count: usize) {
    metrics::gauge!("sidecar_runners_ready").set(count as f64);
}

/// Update the in-flight proxy call gauge
pub fn update_in_flight(count: usize) {
    metrics::gauge!("sidecar_in_flight_requests").set(count as f64);
}
