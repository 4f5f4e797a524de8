//! Prometheus metrics for the response cache.
//!
//! Counters are labelled by logical endpoint (`budgets`, `budget-summary`),
//! never by tenant, to keep cardinality bounded.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_STORES_TOTAL: &str = "cache_stores_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const CACHE_BACKEND_DEMOTIONS_TOTAL: &str = "cache_backend_demotions_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized
/// or another recorder is installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders the handle ourselves
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_cache_hit(endpoint: &str) {
    counter!(names::CACHE_HITS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_cache_miss(endpoint: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_cache_store(endpoint: &str) {
    counter!(names::CACHE_STORES_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

/// `endpoint` is `*` for whole-tenant invalidations.
pub fn record_invalidation(endpoint: &str) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_backend_demotion() {
    counter!(names::CACHE_BACKEND_DEMOTIONS_TOTAL).increment(1);
}
