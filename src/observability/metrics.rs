//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bridge_commits_total` (counter): heads committed, by side and path
//!   (`keep_alive`, `non_persistent`, `upgrade`)
//! - `bridge_pool_recycles_total` (counter): recycle attempts by result
//! - `bridge_pool_takes_total` (counter): pool lookups by result
//! - `bridge_upgrades_total` (counter): handler swaps by result
//! - `bridge_early_terminations_total` (counter)
//! - `bridge_pool_idle_connections` (gauge): idle pooled transports
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - The Prometheus exporter is only installed when enabled in config

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter, serving scrapes on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_commit(side: &'static str, path: &'static str) {
    metrics::counter!("bridge_commits_total", "side" => side, "path" => path).increment(1);
}

pub fn record_recycle(accepted: bool) {
    let result = if accepted { "accepted" } else { "rejected" };
    metrics::counter!("bridge_pool_recycles_total", "result" => result).increment(1);
}

pub fn record_take(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("bridge_pool_takes_total", "result" => result).increment(1);
}

pub fn record_upgrade(success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("bridge_upgrades_total", "result" => result).increment(1);
}

pub fn record_early_termination() {
    metrics::counter!("bridge_early_terminations_total").increment(1);
}

pub fn record_pool_idle(count: usize) {
    metrics::gauge!("bridge_pool_idle_connections").set(count as f64);
}
