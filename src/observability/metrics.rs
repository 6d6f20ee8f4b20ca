//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (exchanges, cache, auth, bridge)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `exchange_requests_total` (counter): completed exchanges by method, status
//! - `exchange_duration_seconds` (histogram): time from head parsed to response sent
//! - `exchange_cancelled_total` (counter): exchanges cancelled before completion
//! - `chain_errors_total` (counter): errors mapped to responses, by status
//! - `cache_lookups_total` (counter): by outcome (hit, miss, validated, bypass)
//! - `cache_compactions_total` (counter): compaction passes
//! - `auth_attempts_total` (counter): by scheme, outcome
//! - `bridge_rejections_total` (counter): blocking submissions refused
//! - `server_active_connections` (gauge)
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Labels are low-cardinality: no paths, no hosts

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_exchange(method: &str, status: u16, start: Instant) {
    counter!(
        "exchange_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("exchange_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_exchange_cancelled() {
    counter!("exchange_cancelled_total").increment(1);
}

pub fn record_chain_error(status: u16) {
    counter!("chain_errors_total", "status" => status.to_string()).increment(1);
}

pub fn record_cache_lookup(outcome: &'static str) {
    counter!("cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_compaction(removed: usize) {
    counter!("cache_compactions_total").increment(1);
    counter!("cache_entries_evicted_total").increment(removed as u64);
}

pub fn record_auth_attempt(scheme: &'static str, outcome: &'static str) {
    counter!("auth_attempts_total", "scheme" => scheme, "outcome" => outcome).increment(1);
}

pub fn record_bridge_rejection() {
    counter!("bridge_rejections_total").increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("server_active_connections").set(count as f64);
}
