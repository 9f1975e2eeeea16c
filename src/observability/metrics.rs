//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sparx_connections_accepted_total` (counter)
//! - `sparx_connections_rejected_total` (counter): by reason
//! - `sparx_active_connections` (gauge)
//! - `sparx_requests_total` (counter): by method, status
//! - `sparx_request_duration_seconds` (histogram)
//! - `sparx_queue_rejected_total` (counter): by reason
//! - `sparx_auto_close_total` (counter): by stage
//! - `sparx_timeouts_total` (counter): by kind
//! - `sparx_websocket_frames_total` (counter): by direction, kind

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("sparx_connections_accepted_total").increment(1);
}

pub fn record_connection_rejected(reason: &'static str) {
    counter!("sparx_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn connection_opened() {
    gauge!("sparx_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("sparx_active_connections").decrement(1.0);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "sparx_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("sparx_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_queue_rejected(reason: &'static str) {
    counter!("sparx_queue_rejected_total", "reason" => reason).increment(1);
}

pub fn record_auto_close(stage: &'static str) {
    counter!("sparx_auto_close_total", "stage" => stage).increment(1);
}

pub fn record_timeout(kind: &'static str) {
    counter!("sparx_timeouts_total", "kind" => kind).increment(1);
}

pub fn record_ws_frame(direction: &'static str, kind: &'static str) {
    counter!(
        "sparx_websocket_frames_total",
        "direction" => direction,
        "kind" => kind
    )
    .increment(1);
}
