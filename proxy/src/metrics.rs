//! Prometheus metrics for the proxy

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, CounterVec, Encoder, TextEncoder};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_proxy_requests_total",
        "Proxied requests by endpoint and HTTP status",
        &["endpoint", "status"]
    )
    .unwrap()
});

pub static STREAMED_BYTES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_proxy_streamed_bytes_total",
        "Capture bytes written to HTTP responses",
        &["endpoint"]
    )
    .unwrap()
});

pub static CLIENT_DISCONNECTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rpcprof_proxy_client_disconnects_total",
        "Captures abandoned because the HTTP client went away",
        &["endpoint"]
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
