//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define transport metrics (connections, exchanges, violations, timeouts)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `transport_connections_active` (gauge): open channels
//! - `transport_exchanges_total` (counter): exchanges started, by version
//! - `transport_protocol_violations_total` (counter): dropped illegal events, by state
//! - `transport_stream_timeouts_total` (counter): exchanges ended by idle timeout
//! - `transport_pool_leases_total` (counter): client pool leases, by outcome
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels are static strings only

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::exchange::ListenerState;
use crate::net::connection::HttpVersion;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    gauge!("transport_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("transport_connections_active").decrement(1.0);
}

pub fn record_exchange_started(version: HttpVersion) {
    counter!("transport_exchanges_total", "version" => version.as_str()).increment(1);
}

pub fn record_protocol_violation(state: ListenerState) {
    counter!("transport_protocol_violations_total", "state" => state.name()).increment(1);
}

pub fn record_stream_timeout() {
    counter!("transport_stream_timeouts_total").increment(1);
}

pub fn record_pool_lease(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("transport_pool_leases_total", "outcome" => outcome).increment(1);
}
