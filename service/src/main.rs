//! rpcprof diagnostics server
//!
//! Serves the diagnostics of its own process over the `rpcprof.v1.Pprof` gRPC
//! service, on TCP or a Unix domain socket. Pair it with `rpcprof-proxy` to
//! browse them over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use rpcprof_service::config::{ListenTarget, ServerConfig};
use rpcprof_service::diagnostics::ProcessDiagnostics;
use rpcprof_service::proto::pprof_server::PprofServer;
use rpcprof_service::server::{auth, grpc::PprofService, http};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type PprofGrpc = PprofServer<PprofService<ProcessDiagnostics>>;

#[derive(Parser, Debug)]
#[command(name = "rpcprof-server")]
#[command(about = "Serve this process's diagnostics over gRPC", long_about = None)]
#[command(version)]
struct Args {
    /// Listen address, `host:port` or `unix://path` [default: unix://pprof.sock]
    listen: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Admin HTTP address for /healthz, /readyz and /metrics
    #[arg(long)]
    admin_addr: Option<String>,

    /// Capture sampling interval (e.g. "10ms")
    #[arg(long)]
    sample_interval: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(admin) = args.admin_addr {
        config.admin_addr = Some(admin);
    }
    if let Some(interval) = &args.sample_interval {
        let interval = rpcprof_shared::utils::parse_duration(interval)
            .context("Failed to parse sample interval")?;
        config.sample_interval_ms = interval.as_millis() as u64;
    }

    run(config).await
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();
}

async fn run(config: ServerConfig) -> Result<()> {
    let target = config.listen_target()?;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let ready = Arc::new(AtomicBool::new(false));
    let admin = match config.admin_socket_addr()? {
        Some(addr) => {
            let ready = ready.clone();
            let stop = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = http::serve_admin(addr, ready, stop.cancelled_owned()).await {
                    warn!("Admin HTTP server failed: {}", e);
                }
            }))
        }
        None => None,
    };

    let diagnostics = Arc::new(ProcessDiagnostics::new(config.sampler()));
    let service = PprofService::new(diagnostics)
        .with_max_message_size(config.max_message_size)
        .into_server();
    if config.auth_token.as_deref().is_some_and(|t| !t.is_empty()) {
        info!("gRPC bearer token authentication enabled");
    }
    let service = InterceptedService::new(
        service,
        auth::make_auth_interceptor(config.auth_token.clone()),
    );

    let (mut health, health_service) = tonic_health::server::health_reporter();
    health.set_serving::<PprofGrpc>().await;

    let router = Server::builder()
        .add_service(health_service)
        .add_service(service);

    match target {
        ListenTarget::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Serving diagnostics on {}", listener.local_addr()?);
            ready.store(true, Ordering::Release);
            router
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::TcpListenerStream::new(listener),
                    shutdown.cancelled(),
                )
                .await
                .context("gRPC server error")?;
        }
        ListenTarget::Unix(path) => {
            let listener = bind_unix(&path)?;
            info!("Serving diagnostics on unix://{}", path.display());
            ready.store(true, Ordering::Release);
            let served = router
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled(),
                )
                .await;
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove socket {}: {}", path.display(), e);
            }
            served.context("gRPC server error")?;
        }
    }

    if let Some(admin) = admin {
        let _ = admin.await;
    }
    info!("Server stopped");
    Ok(())
}

/// Bind a Unix socket, replacing a stale socket file left by an earlier run.
fn bind_unix(path: &Path) -> Result<tokio::net::UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind unix://{}", path.display()))
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });
}
