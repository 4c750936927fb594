//! gRPC service implementation

use crate::audit;
use crate::diagnostics::{CaptureKind, CaptureSink, Diagnostics, DiagnosticsError};
use crate::metrics;
use bytes::Bytes;
use rpcprof_shared::io::{ChunkSender, ChunkWriter};
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

pub mod proto {
    tonic::include_proto!("rpcprof.v1");
}

use proto::{
    pprof_server::{Pprof, PprofServer},
    Chunk, CmdlineRequest, CmdlineResponse, CpuProfileRequest, LookupRequest, LookupResponse,
    SymbolRequest, SymbolResponse, TraceRequest,
};

impl From<Chunk> for Bytes {
    fn from(chunk: Chunk) -> Self {
        chunk.chunk
    }
}

/// Chunks a capture may run ahead of the client before the backend's writes
/// wait.
pub const CAPTURE_CHANNEL_DEPTH: usize = 16;

/// Default cap on a single gRPC message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How long a failed capture waits for the client to take queued chunks
/// before the error status is sent anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(5);

type CaptureStream = ReceiverStream<Result<Chunk, Status>>;

/// gRPC server state
pub struct PprofService<D> {
    diagnostics: Arc<D>,
    max_message_size: usize,
}

impl<D: Diagnostics> PprofService<D> {
    pub fn new(diagnostics: Arc<D>) -> Self {
        Self {
            diagnostics,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn into_server(self) -> PprofServer<Self> {
        let limit = self.max_message_size;
        PprofServer::new(self)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit)
    }

    fn start_capture(
        &self,
        kind: CaptureKind,
        requested: Option<prost_types::Duration>,
    ) -> Result<Response<CaptureStream>, Status> {
        let duration = capture_duration(requested)?;

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);
        let sink: CaptureSink = Box::pin(ChunkWriter::new(StreamSender::new(tx.clone(), kind)));
        let capture = self
            .diagnostics
            .start_capture(kind, sink)
            .map_err(|e| {
                metrics::CAPTURES_TOTAL
                    .with_label_values(&[kind.as_str(), "rejected"])
                    .inc();
                Status::from(e)
            })?;

        metrics::ACTIVE_CAPTURES
            .with_label_values(&[kind.as_str()])
            .inc();
        audit::capture_started(kind.as_str(), duration.as_secs_f64());
        tokio::spawn(supervise_capture(capture, kind, duration, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Validate a requested capture duration: present, positive and representable.
pub fn capture_duration(requested: Option<prost_types::Duration>) -> Result<Duration, Status> {
    requested
        .clone()
        .and_then(|d| Duration::try_from(d).ok())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            Status::invalid_argument(format!("passed in duration is invalid: {:?}", requested))
        })
}

/// Run a capture until its duration elapses or the client goes away, then
/// stop it. The response stream ends once the capture's sink and `tx` are
/// both dropped.
async fn supervise_capture(
    capture: Box<dyn crate::diagnostics::Capture>,
    kind: CaptureKind,
    duration: Duration,
    tx: mpsc::Sender<Result<Chunk, Status>>,
) {
    let started = Instant::now();
    let cancelled = tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = tx.closed() => true,
    };
    if cancelled {
        info!(
            %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Client went away, stopping capture early"
        );
    }

    let outcome = match capture.stop().await {
        Ok(()) if cancelled => "cancelled",
        Ok(()) => "completed",
        Err(e) if cancelled => {
            // Flushing into a closed stream is expected to fail.
            debug!(%kind, error = %e, "capture stop after cancel");
            "cancelled"
        }
        Err(e) => {
            warn!(%kind, error = %e, "capture failed");
            // A status queued right behind data can cost the client that data.
            wait_drained(&tx).await;
            let _ = tx.send(Err(Status::from(e))).await;
            "failed"
        }
    };

    let elapsed = started.elapsed();
    metrics::ACTIVE_CAPTURES
        .with_label_values(&[kind.as_str()])
        .dec();
    metrics::CAPTURES_TOTAL
        .with_label_values(&[kind.as_str(), outcome])
        .inc();
    metrics::CAPTURE_DURATION
        .with_label_values(&[kind.as_str()])
        .observe(elapsed.as_secs_f64());
    info!(%kind, outcome, elapsed_ms = elapsed.as_millis() as u64, "capture finished");
}

/// Wait until every queued chunk has been taken off the channel and given a
/// moment to reach the wire, or until the client is gone.
async fn wait_drained(tx: &mpsc::Sender<Result<Chunk, Status>>) {
    let drained = async {
        while tx.capacity() < tx.max_capacity() && !tx.is_closed() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drained).await.is_err() {
        debug!(queued = tx.max_capacity() - tx.capacity(), "client slow to drain capture");
    }
}

/// Sends capture bytes down a server-streaming response.
struct StreamSender {
    tx: PollSender<Result<Chunk, Status>>,
    kind: CaptureKind,
}

impl StreamSender {
    fn new(tx: mpsc::Sender<Result<Chunk, Status>>, kind: CaptureKind) -> Self {
        Self {
            tx: PollSender::new(tx),
            kind,
        }
    }
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "capture stream closed")
}

impl ChunkSender for StreamSender {
    type Error = io::Error;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.tx.poll_reserve(cx).map_err(|_| stream_closed())
    }

    fn send(&mut self, chunk: Bytes) -> Result<(), io::Error> {
        let len = chunk.len();
        self.tx
            .send_item(Ok(Chunk { chunk }))
            .map_err(|_| stream_closed())?;
        metrics::CAPTURE_BYTES
            .with_label_values(&[self.kind.as_str()])
            .inc_by(len as f64);
        Ok(())
    }
}

#[tonic::async_trait]
impl<D: Diagnostics> Pprof for PprofService<D> {
    async fn cmdline(
        &self,
        _request: Request<CmdlineRequest>,
    ) -> Result<Response<CmdlineResponse>, Status> {
        Ok(Response::new(CmdlineResponse {
            command: self.diagnostics.command_line(),
        }))
    }

    type CpuProfileStream = CaptureStream;

    async fn cpu_profile(
        &self,
        request: Request<CpuProfileRequest>,
    ) -> Result<Response<Self::CpuProfileStream>, Status> {
        self.start_capture(CaptureKind::Cpu, request.into_inner().duration)
    }

    type TraceStream = CaptureStream;

    async fn trace(
        &self,
        request: Request<TraceRequest>,
    ) -> Result<Response<Self::TraceStream>, Status> {
        self.start_capture(CaptureKind::Trace, request.into_inner().duration)
    }

    async fn symbol(
        &self,
        request: Request<SymbolRequest>,
    ) -> Result<Response<SymbolResponse>, Status> {
        let addr = request.into_inner().symbol;
        let diagnostics = self.diagnostics.clone();
        let result = run_blocking(move || diagnostics.symbol(addr)).await?;

        let outcome = if result.is_ok() { "found" } else { "not_found" };
        metrics::SYMBOL_LOOKUPS_TOTAL
            .with_label_values(&[outcome])
            .inc();

        let name = result?;
        Ok(Response::new(SymbolResponse { symbol: addr, name }))
    }

    async fn lookup(
        &self,
        request: Request<LookupRequest>,
    ) -> Result<Response<LookupResponse>, Status> {
        let req = request.into_inner();
        debug!(name = %req.name, debug = req.debug, gc = req.gc_before_heap, "lookup");

        let diagnostics = self.diagnostics.clone();
        let result = run_blocking(move || {
            diagnostics.lookup(&req.name, req.debug, req.gc_before_heap)
        })
        .await?;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(DiagnosticsError::ProfileNotFound(_)) => "not_found",
            Err(_) => "error",
        };
        metrics::LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();

        Ok(Response::new(LookupResponse { data: result? }))
    }
}

/// Backend calls may block on file IO; keep them off the runtime workers.
async fn run_blocking<T, F>(f: F) -> Result<Result<T, DiagnosticsError>, Status>
where
    F: FnOnce() -> Result<T, DiagnosticsError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("diagnostics task failed: {}", e)))
}
