//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed on a dedicated listener (`METRICS_PORT`, default 9090)
//! separate from the API port.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `exampro_rate_limit_rejections_total` - Requests refused with 429 (label: policy)
//! - `exampro_dedup_hits_total` - GET requests answered from a coalesced response
//! - `exampro_slow_requests_total` - Requests slower than `SLOW_REQUEST_THRESHOLD_MS`
//!
//! ## Histograms
//! - `exampro_http_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `exampro_process_resident_memory_bytes`
//! - `exampro_process_virtual_memory_bytes`
//! - `exampro_system_used_memory_bytes`
//! - `exampro_system_total_memory_bytes`
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder,
//! so tests and metrics-disabled deployments can call them freely.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::monitor::MemorySample;

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "exampro_rate_limit_rejections_total";
    pub const DEDUP_HITS_TOTAL: &str = "exampro_dedup_hits_total";
    pub const SLOW_REQUESTS_TOTAL: &str = "exampro_slow_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "exampro_http_request_duration_seconds";
    pub const PROCESS_RESIDENT_MEMORY_BYTES: &str = "exampro_process_resident_memory_bytes";
    pub const PROCESS_VIRTUAL_MEMORY_BYTES: &str = "exampro_process_virtual_memory_bytes";
    pub const SYSTEM_USED_MEMORY_BYTES: &str = "exampro_system_used_memory_bytes";
    pub const SYSTEM_TOTAL_MEMORY_BYTES: &str = "exampro_system_total_memory_bytes";
}

/// Install the Prometheus exporter and describe every metric.
///
/// # Errors
///
/// Fails if the listener cannot be bound or a global recorder is already
/// installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Requests rejected by a rate-limit policy"
    );
    describe_counter!(
        names::DEDUP_HITS_TOTAL,
        "GET requests served from a coalesced in-flight or cached response"
    );
    describe_counter!(
        names::SLOW_REQUESTS_TOTAL,
        "Requests exceeding the slow-request threshold"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::PROCESS_RESIDENT_MEMORY_BYTES,
        "Resident set size of this process"
    );
    describe_gauge!(
        names::PROCESS_VIRTUAL_MEMORY_BYTES,
        "Virtual memory size of this process"
    );
    describe_gauge!(names::SYSTEM_USED_MEMORY_BYTES, "Host memory in use");
    describe_gauge!(names::SYSTEM_TOTAL_MEMORY_BYTES, "Total host memory");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Record a request refused by the named policy.
pub fn record_rate_limit_rejection(policy: &'static str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "policy" => policy).increment(1);
}

/// Record a GET answered without running its handler.
pub fn record_dedup_hit() {
    counter!(names::DEDUP_HITS_TOTAL).increment(1);
}

pub fn record_slow_request() {
    counter!(names::SLOW_REQUESTS_TOTAL).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

/// Publish a memory sample.
#[allow(clippy::cast_precision_loss)]
pub fn set_memory_gauges(sample: &MemorySample) {
    gauge!(names::PROCESS_RESIDENT_MEMORY_BYTES).set(sample.process_resident_bytes as f64);
    gauge!(names::PROCESS_VIRTUAL_MEMORY_BYTES).set(sample.process_virtual_bytes as f64);
    gauge!(names::SYSTEM_USED_MEMORY_BYTES).set(sample.system_used_bytes as f64);
    gauge!(names::SYSTEM_TOTAL_MEMORY_BYTES).set(sample.system_total_bytes as f64);
}
