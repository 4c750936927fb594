//! HTTP `/debug/pprof` proxy for the rpcprof gRPC diagnostics service
//!
//! Serves the conventional pprof endpoint layout over HTTP and answers each
//! request with a call to a `rpcprof.v1.Pprof` service reachable over TCP or
//! a Unix domain socket.

pub mod client;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod sink;
pub mod status;
pub mod symbol;

pub use proxy::PprofProxy;
