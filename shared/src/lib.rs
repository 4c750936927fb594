//! Shared building blocks for rpcprof
//!
//! This crate contains the transport-agnostic pieces used by both the
//! diagnostics service and the HTTP proxy: the chunk stream adapters that turn
//! a stream of RPC messages into bytes and back, configuration loading, and
//! small utilities.

pub mod config;
pub mod io;
pub mod utils;

// Re-export commonly used types
pub use io::{ChunkReader, ChunkReceiver, ChunkSender, ChunkWriter};
