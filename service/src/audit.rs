//! Audit logging for access to the diagnostics endpoints.
//!
//! Events go through `tracing` with a dedicated target so they can be routed
//! or filtered separately (`RUST_LOG=rpcprof::audit=info`).

use tracing::{info, warn};

pub const AUDIT_TARGET: &str = "rpcprof::audit";

/// gRPC call admitted (valid bearer token, or authentication disabled).
pub fn grpc_auth_success() {
    info!(
        target: AUDIT_TARGET,
        event = "grpc_auth_success",
        result = "ok",
    );
}

pub fn grpc_auth_failure(reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "grpc_auth_failure",
        result = "denied",
        reason = %reason,
    );
}

/// A capture began streaming process data to a client.
pub fn capture_started(kind: &str, seconds: f64) {
    info!(
        target: AUDIT_TARGET,
        event = "capture_started",
        kind = %kind,
        seconds,
    );
}

pub fn admin_http_request(path: &str, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %status,
    );
}
