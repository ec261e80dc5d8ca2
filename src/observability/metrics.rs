//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status
//! - `proxy_request_duration_seconds` (histogram): latency by frontend
//! - `proxy_rejected_total` (counter): shaping rejections by reason
//! - `proxy_change_events_total` (counter): applied events by kind, result
//! - `proxy_supervisor_restarts_total` (counter): hot restarts performed
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed
//! - Exporter install failure is logged, never fatal

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        );

    let builder = match builder {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "Invalid histogram buckets, using defaults");
            PrometheusBuilder::new().with_http_listener(addr)
        }
    };

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, frontend: &str, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "proxy_request_duration_seconds",
        "frontend" => frontend.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_rejected(reason: &'static str) {
    counter!("proxy_rejected_total", "reason" => reason).increment(1);
}

pub fn record_change_event(kind: &'static str, result: &'static str) {
    counter!("proxy_change_events_total", "kind" => kind, "result" => result).increment(1);
}

pub fn record_restart() {
    counter!("proxy_supervisor_restarts_total").increment(1);
}
