//! Diagnostics service library
//!
//! Exposes the diagnostics of the hosting process over the `rpcprof.v1.Pprof`
//! gRPC service. Embed it by handing [`server::grpc::PprofService`] a
//! [`diagnostics::Diagnostics`] backend, or run the `rpcprof-server` binary.

pub mod audit;
pub mod config;
pub mod diagnostics;
pub mod metrics;
pub mod server;

pub use server::grpc::proto;
