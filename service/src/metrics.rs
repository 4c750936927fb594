//! Prometheus metrics for the diagnostics server

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

// ── Capture metrics ──────────────────────────────────────────────────────────

pub static CAPTURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_captures_total",
        "Captures finished, by kind and outcome",
        &["kind", "outcome"]
    )
    .unwrap()
});

pub static ACTIVE_CAPTURES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "rpcprof_active_captures",
        "Captures currently running",
        &["kind"]
    )
    .unwrap()
});

pub static CAPTURE_BYTES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_capture_bytes_total",
        "Capture bytes sent as stream chunks",
        &["kind"]
    )
    .unwrap()
});

pub static CAPTURE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rpcprof_capture_duration_seconds",
        "Wall time from capture start to stop",
        &["kind"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap()
});

// ── Unary lookups ────────────────────────────────────────────────────────────

pub static LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_lookups_total",
        "Named profile lookups",
        &["outcome"]
    )
    .unwrap()
});

pub static SYMBOL_LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_symbol_lookups_total",
        "Address symbolization requests",
        &["outcome"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
