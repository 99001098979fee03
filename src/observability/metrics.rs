//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_filter_requests_total` (counter): requests seen by the filter
//! - `proxy_xsrf_tokens_propagated_total` (counter): cookie → header copies
//! - `proxy_upstream_health` (gauge): 1=healthy, 0=unhealthy
//! - `proxy_websocket_sessions_total` (counter): sessions by outcome
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_filter(token_propagated: bool) {
    counter!("proxy_filter_requests_total").increment(1);
    if token_propagated {
        counter!("proxy_xsrf_tokens_propagated_total").increment(1);
    }
}

pub fn record_upstream_health(upstream: &str, healthy: bool) {
    gauge!("proxy_upstream_health", "upstream" => upstream.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_retry(reason: &'static str) {
    counter!("proxy_upstream_retries_total", "reason" => reason).increment(1);
}

pub fn record_websocket(outcome: &'static str) {
    counter!("proxy_websocket_sessions_total", "outcome" => outcome).increment(1);
}
