//! HTTP to gRPC dispatch
//!
//! Every request under the pprof prefix is answered by one call to the
//! diagnostics service, picked by the last path segment. Captures stream: the
//! response headers go out as soon as the call is accepted and the body
//! follows chunk by chunk.

use crate::client::Client;
use crate::config::ProxyConfig;
use crate::metrics;
use crate::sink::{BodyChunk, BodyWriter, FlushingSink};
use crate::status::{error_response, text_error, TEXT_PLAIN};
use crate::symbol::{parse_addresses, SymbolTable};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use rpcprof_service::proto::{
    CmdlineRequest, CpuProfileRequest, LookupRequest, SymbolRequest, TraceRequest,
};
use rpcprof_shared::io::ChunkReader;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, info, warn};

/// Body chunks buffered between the copy task and hyper.
const BODY_CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Profile,
    Trace,
}

impl CaptureKind {
    fn endpoint(self) -> &'static str {
        match self {
            CaptureKind::Profile => "profile",
            CaptureKind::Trace => "trace",
        }
    }
}

/// Forwards `/debug/pprof/*` requests to the diagnostics service.
#[derive(Clone)]
pub struct PprofProxy {
    client: Client,
    path_prefix: String,
    default_capture_secs: i64,
    capture_grace: Duration,
}

impl PprofProxy {
    pub fn new(client: Client, config: &ProxyConfig) -> Self {
        Self {
            client,
            path_prefix: config.path_prefix.clone(),
            default_capture_secs: config.default_capture_secs,
            capture_grace: config.capture_grace(),
        }
    }

    /// Entry point for the HTTP server: forwards requests under the prefix and
    /// answers `/healthz` and `/metrics` itself.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path();
        if path.starts_with(&self.path_prefix) {
            return self.handle(req).await;
        }
        match path {
            "/healthz" => plain(StatusCode::OK, "text/plain", Body::from("ok\n")),
            "/metrics" => plain(
                StatusCode::OK,
                "text/plain; version=0.0.4",
                Body::from(metrics::encode_metrics()),
            ),
            _ => text_error(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// Dispatch one pprof request by its last path segment.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let name = last_segment(req.uri().path()).to_string();
        let query = req.uri().query().unwrap_or_default().to_string();

        let (endpoint, result) = match name.as_str() {
            "profile" => ("profile", self.capture(CaptureKind::Profile, &query).await),
            "trace" => ("trace", self.capture(CaptureKind::Trace, &query).await),
            "cmdline" => ("cmdline", self.cmdline().await),
            "symbol" => ("symbol", Ok(self.symbol(req).await)),
            _ => ("lookup", self.lookup(&name, &query).await),
        };

        let response = result.unwrap_or_else(|status| {
            debug!(endpoint, code = ?status.code(), message = status.message(), "rpc failed");
            error_response(&status)
        });
        metrics::REQUESTS_TOTAL
            .with_label_values(&[endpoint, response.status().as_str()])
            .inc();
        response
    }

    async fn capture(&self, kind: CaptureKind, query: &str) -> Result<Response<Body>, Status> {
        let seconds = capture_seconds(query, self.default_capture_secs);
        let duration = Some(prost_types::Duration { seconds, nanos: 0 });

        let mut client = self.client.clone();
        let stream = match kind {
            CaptureKind::Profile => client.cpu_profile(CpuProfileRequest { duration }).await?,
            CaptureKind::Trace => client.trace(TraceRequest { duration }).await?,
        }
        .into_inner();
        info!(endpoint = kind.endpoint(), seconds, "streaming capture");

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let sink = FlushingSink::new(BodyWriter::new(tx.clone()));
        let deadline = Duration::from_secs(seconds.max(0) as u64) + self.capture_grace;
        tokio::spawn(forward_capture(
            kind.endpoint(),
            ChunkReader::new(stream),
            sink,
            tx,
            deadline,
        ));

        let mut response = plain(
            StatusCode::OK,
            "application/octet-stream",
            Body::wrap_stream(ReceiverStream::new(rx)),
        );
        let disposition = format!("attachment; filename=\"{}\"", kind.endpoint());
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
        Ok(response)
    }

    async fn cmdline(&self) -> Result<Response<Body>, Status> {
        let command = self
            .client
            .clone()
            .cmdline(CmdlineRequest {})
            .await?
            .into_inner()
            .command;
        Ok(plain(StatusCode::OK, TEXT_PLAIN, Body::from(command)))
    }

    async fn symbol(&self, req: Request<Body>) -> Response<Body> {
        let mut table = SymbolTable::new();
        let mut read_error = None;

        let input = if req.method() == Method::POST {
            match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => body,
                Err(e) => {
                    read_error = Some(e);
                    Default::default()
                }
            }
        } else {
            bytes::Bytes::copy_from_slice(req.uri().query().unwrap_or_default().as_bytes())
        };

        let mut client = self.client.clone();
        for addr in parse_addresses(&input) {
            match client.symbol(SymbolRequest { symbol: addr }).await {
                Ok(res) => table.push(addr, &res.into_inner().name),
                Err(status) => {
                    debug!(addr = format_args!("{:#x}", addr), code = ?status.code(), "symbol unresolved")
                }
            }
        }
        if let Some(e) = read_error {
            table.push_read_error(e);
        }

        plain(StatusCode::OK, TEXT_PLAIN, Body::from(table.into_string()))
    }

    async fn lookup(&self, name: &str, query: &str) -> Result<Response<Body>, Status> {
        let debug = query_param(query, "debug")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        let gc_before_heap = query_param(query, "gc")
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|gc| gc > 0);

        let data = self
            .client
            .clone()
            .lookup(LookupRequest {
                name: name.to_string(),
                debug,
                gc_before_heap,
            })
            .await?
            .into_inner()
            .data;
        Ok(plain(StatusCode::OK, TEXT_PLAIN, Body::from(data)))
    }
}

/// Copy a capture stream into the response body until the stream ends, the
/// copy fails, the deadline passes or the client goes away. Returning drops
/// the gRPC stream, which cancels the call on the server.
async fn forward_capture<R>(
    endpoint: &'static str,
    mut reader: R,
    mut sink: FlushingSink<BodyWriter>,
    body: mpsc::Sender<BodyChunk>,
    deadline: Duration,
) where
    R: AsyncRead + Unpin,
{
    let pump = async move {
        let result = match tokio::io::copy(&mut reader, &mut sink).await {
            Ok(_) => sink.shutdown().await,
            Err(e) => Err(e),
        };
        (result, sink.get_ref().shipped())
    };

    tokio::select! {
        finished = tokio::time::timeout(deadline, pump) => match finished {
            Ok((Ok(()), shipped)) => {
                metrics::STREAMED_BYTES.with_label_values(&[endpoint]).inc_by(shipped as f64);
                debug!(endpoint, bytes = shipped, "capture streamed");
            }
            Ok((Err(e), shipped)) => {
                metrics::STREAMED_BYTES.with_label_values(&[endpoint]).inc_by(shipped as f64);
                if e.kind() == io::ErrorKind::BrokenPipe {
                    metrics::CLIENT_DISCONNECTS.with_label_values(&[endpoint]).inc();
                    info!(endpoint, bytes = shipped, "client went away during capture");
                } else {
                    warn!(endpoint, bytes = shipped, error = %e, "capture stream failed");
                    abort_body(&body, e).await;
                }
            }
            Err(_) => {
                warn!(endpoint, ?deadline, "capture overran its deadline");
                abort_body(&body, io::Error::new(io::ErrorKind::TimedOut, "capture deadline exceeded")).await;
            }
        },
        _ = body.closed() => {
            metrics::CLIENT_DISCONNECTS.with_label_values(&[endpoint]).inc();
            info!(endpoint, "client went away during capture");
        }
    }
}

/// End the response body with an error so the client sees a truncated
/// transfer rather than a complete one.
async fn abort_body(body: &mpsc::Sender<BodyChunk>, err: io::Error) {
    let _ = body.send(Err(err)).await;
}

fn plain(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Final path segment, ignoring trailing slashes.
fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// First value of `key` in a raw query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}

/// Requested capture length. Missing, zero and unparsable values fall back to
/// `default`; negative values are passed on for the service to reject.
fn capture_seconds(query: &str, default: i64) -> i64 {
    match query_param(query, "seconds").and_then(|v| v.parse::<i64>().ok()) {
        Some(0) | None => default,
        Some(secs) => secs,
    }
}
