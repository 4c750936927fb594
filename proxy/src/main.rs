//! rpcprof HTTP proxy
//!
//! Exposes a process's `rpcprof.v1.Pprof` gRPC service as the usual
//! `/debug/pprof/*` HTTP endpoints, so `go tool pprof`-style tooling and
//! browsers can reach it.

use anyhow::{Context, Result};
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use rpcprof_proxy::config::ProxyConfig;
use rpcprof_proxy::{client, PprofProxy};
use std::convert::Infallible;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rpcprof-proxy")]
#[command(about = "Serve /debug/pprof over HTTP from an rpcprof gRPC service", long_about = None)]
#[command(version)]
struct Args {
    /// gRPC service to forward to: `unix://path` or `host:port` [default: unix://pprof.sock]
    endpoint: Option<String>,

    /// HTTP listen address [default: 127.0.0.1:8080]
    #[arg(short, long)]
    listen: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token for the gRPC service
    #[arg(long, env = "RPCPROF_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

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

    let mut config = ProxyConfig::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.auth_token.is_some() {
        config.auth_token = args.auth_token;
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

async fn run(config: ProxyConfig) -> Result<()> {
    let addr = config.listen_socket_addr()?;
    let client = client::connect(&config)?;
    let proxy = PprofProxy::new(client, &config);

    let make_svc = make_service_fn(move |_| {
        let proxy = proxy.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.route(req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(make_svc);
    info!(
        "Proxying http://{}{} to {}",
        server.local_addr(),
        config.path_prefix,
        config.endpoint
    );

    server
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutting down"),
                Err(e) => {
                    warn!("Failed to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}
