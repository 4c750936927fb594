//! Network-facing parts of the service: the gRPC API, its authentication and
//! the admin HTTP endpoint.

pub mod auth;
pub mod grpc;
pub mod http;
