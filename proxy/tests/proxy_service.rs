//! Proxy tests against the real gRPC service with a scripted backend.

use hyper::body::HttpBody;
use hyper::{Body, Request, Response, StatusCode};
use rpcprof_proxy::config::ProxyConfig;
use rpcprof_proxy::{client, PprofProxy};
use rpcprof_service::diagnostics::{
    Capture, CaptureKind, CaptureSink, Diagnostics, DiagnosticsError,
};
use rpcprof_service::server::grpc::PprofService;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

/// Backend that writes one line when a capture starts and one when it stops.
struct ScriptedDiagnostics;

struct ScriptedCapture {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[tonic::async_trait]
impl Capture for ScriptedCapture {
    async fn stop(self: Box<Self>) -> Result<(), DiagnosticsError> {
        let this = *self;
        let _ = this.stop.send(());
        let _ = this.task.await;
        Ok(())
    }
}

impl Diagnostics for ScriptedDiagnostics {
    fn command_line(&self) -> String {
        "scripted\0--serve".to_string()
    }

    fn start_capture(
        &self,
        kind: CaptureKind,
        mut sink: CaptureSink,
    ) -> Result<Box<dyn Capture>, DiagnosticsError> {
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = sink.write_all(format!("{} started\n", kind).as_bytes()).await;
            let _ = stop_rx.await;
            let _ = sink.write_all(format!("{} stopped\n", kind).as_bytes()).await;
            let _ = sink.shutdown().await;
        });
        Ok(Box::new(ScriptedCapture { stop, task }))
    }

    fn symbol(&self, addr: u64) -> Result<String, DiagnosticsError> {
        match addr {
            0x401000 => Ok("main.main".to_string()),
            _ => Err(DiagnosticsError::SymbolNotFound(addr)),
        }
    }

    fn lookup(
        &self,
        name: &str,
        _debug: i32,
        _gc_before_read: bool,
    ) -> Result<Vec<u8>, DiagnosticsError> {
        match name {
            "threads" => Ok(b"threads: 1\n".to_vec()),
            other => Err(DiagnosticsError::ProfileNotFound(other.to_string())),
        }
    }
}

async fn proxy(compress_requests: bool) -> PprofProxy {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = PprofService::new(Arc::new(ScriptedDiagnostics)).into_server();
    tokio::spawn(async move {
        Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let config = ProxyConfig {
        endpoint: addr.to_string(),
        default_capture_secs: 1,
        capture_grace_secs: 5,
        compress_requests,
        ..Default::default()
    };
    PprofProxy::new(client::connect(&config).unwrap(), &config)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_profile_streams_for_default_duration() {
    let proxy = proxy(false).await;

    let started = Instant::now();
    let response = proxy.handle(get("/debug/pprof/profile")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = tokio::time::timeout(Duration::from_millis(800), body.data())
        .await
        .expect("capture start should reach the client before the capture ends")
        .unwrap()
        .unwrap();
    assert_eq!(&first[..], b"cpu started\n");

    let mut rest = Vec::new();
    while let Some(next) = body.data().await {
        rest.extend_from_slice(&next.unwrap());
    }
    assert_eq!(rest, b"cpu stopped\n");
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_lookup_and_symbol() {
    let proxy = proxy(false).await;

    let response = proxy.handle(get("/debug/pprof/threads")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "threads: 1\n");

    let response = proxy.handle(get("/debug/pprof/goroutine")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_text(response).await,
        "could not find profile with name: goroutine\n"
    );

    let response = proxy.handle(get("/debug/pprof/symbol?0x401000+0x9")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "num_symbols: 1\n0x401000 main.main\n");
}

#[tokio::test]
async fn test_compressed_requests_accepted_by_service() {
    let proxy = proxy(true).await;

    let response = proxy.handle(get("/debug/pprof/cmdline")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "scripted\0--serve");

    let response = proxy.handle(get("/debug/pprof/trace?seconds=1")).await;
    assert_eq!(body_text(response).await, "trace started\ntrace stopped\n");
}
