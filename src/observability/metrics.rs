//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rewroute_requests_total` (counter): requests by method, status, outcome
//! - `rewroute_request_duration_seconds` (histogram): latency by outcome
//! - `rewroute_active_connections` (gauge): current connection count
//! - `rewroute_upstream_errors_total` (counter): forwarding failures by kind
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// How a request was finally answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Local,
    Forward,
    NotFound,
    MethodNotAllowed,
    Rejected,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Local => "local",
            Outcome::Forward => "forward",
            Outcome::NotFound => "not_found",
            Outcome::MethodNotAllowed => "method_not_allowed",
            Outcome::Rejected => "rejected",
            Outcome::Error => "error",
        }
    }
}

/// Serve Prometheus metrics on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, outcome: Outcome, start: Instant) {
    ::metrics::counter!(
        "rewroute_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome.as_str(),
    )
    .increment(1);
    ::metrics::histogram!("rewroute_request_duration_seconds", "outcome" => outcome.as_str())
        .record(start.elapsed().as_secs_f64());
}

pub fn upstream_error(kind: &'static str) {
    ::metrics::counter!("rewroute_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn connection_opened() {
    ::metrics::gauge!("rewroute_active_connections").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("rewroute_active_connections").decrement(1.0);
}
