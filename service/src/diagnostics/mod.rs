//! Diagnostics backends
//!
//! The gRPC service never collects anything itself. It validates requests,
//! brackets captures with a timer and stream cancellation, and moves bytes;
//! everything that actually looks at the process goes through [`Diagnostics`].

pub mod process;
mod procfs;

pub use process::{ProcessDiagnostics, SamplerConfig};

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tonic::Status;

/// Destination of a running capture. Every write becomes one stream chunk, so
/// backends should buffer.
pub type CaptureSink = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    Cpu,
    Trace,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Cpu => "cpu",
            CaptureKind::Trace => "trace",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("could not find profile with name: {0}")]
    ProfileNotFound(String),

    #[error("symbol {0:#x} not found")]
    SymbolNotFound(u64),

    #[error("{0} capture already in use")]
    AlreadyRunning(CaptureKind),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DiagnosticsError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DiagnosticsError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<DiagnosticsError> for Status {
    fn from(err: DiagnosticsError) -> Self {
        let message = err.to_string();
        match err {
            DiagnosticsError::ProfileNotFound(_) | DiagnosticsError::SymbolNotFound(_) => {
                Status::not_found(message)
            }
            DiagnosticsError::AlreadyRunning(_) => Status::already_exists(message),
            DiagnosticsError::Io { .. } => Status::internal(message),
        }
    }
}

/// A capture that is collecting into its sink.
#[async_trait]
pub trait Capture: Send {
    /// Stop collecting, write out anything still pending and shut the sink
    /// down. Must return promptly once called.
    async fn stop(self: Box<Self>) -> Result<(), DiagnosticsError>;
}

/// Source of runtime diagnostics for one process.
///
/// `symbol` and `lookup` may block on file IO; the service calls them from
/// the blocking pool.
pub trait Diagnostics: Send + Sync + 'static {
    /// Command line, arguments joined by NUL.
    fn command_line(&self) -> String;

    /// Begin collecting `kind` into `sink`. Fails with
    /// [`DiagnosticsError::AlreadyRunning`] if a capture of that kind is active.
    fn start_capture(
        &self,
        kind: CaptureKind,
        sink: CaptureSink,
    ) -> Result<Box<dyn Capture>, DiagnosticsError>;

    fn symbol(&self, addr: u64) -> Result<String, DiagnosticsError>;

    fn lookup(
        &self,
        name: &str,
        debug: i32,
        gc_before_read: bool,
    ) -> Result<Vec<u8>, DiagnosticsError>;
}
