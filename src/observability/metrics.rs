//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define listener metrics (requests, latency, open replies, feed traffic)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `listener_requests_total` (counter): requests by method, status
//! - `listener_request_duration_seconds` (histogram): time to response head
//! - `listener_pending_responses` (gauge): size of the pending registry
//! - `listener_feed_lines_total` (counter): change rows written, by feed mode
//! - `listener_heartbeats_total` (counter): keep-alive tokens written
//! - `listener_feeds_closed_total` (counter): feeds ended, by reason
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels are bounded sets (method, status, mode, reason)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, elapsed: Duration) {
    counter!(
        "listener_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("listener_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn set_pending_responses(count: usize) {
    gauge!("listener_pending_responses").set(count as f64);
}

pub fn record_feed_lines(mode: &'static str, count: u64) {
    counter!("listener_feed_lines_total", "mode" => mode).increment(count);
}

pub fn record_heartbeat() {
    counter!("listener_heartbeats_total").increment(1);
}

pub fn record_feed_closed(reason: &'static str) {
    counter!("listener_feeds_closed_total", "reason" => reason).increment(1);
}
