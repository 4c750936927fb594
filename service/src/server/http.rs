//! Admin HTTP server for health checks and metrics

use crate::audit;
use crate::metrics;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Serve /healthz, /readyz and /metrics on `addr` until `shutdown` resolves.
///
/// `/readyz` reports ready once `ready` is set, which happens after the gRPC
/// listener is bound.
pub async fn serve_admin(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move { Ok::<_, Infallible>(handle(&req, &ready)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    tracing::info!("Admin HTTP server listening on {}", server.local_addr());
    server.with_graceful_shutdown(shutdown).await
}

fn handle(req: &Request<Body>, ready: &AtomicBool) -> Response<Body> {
    let path = req.uri().path();
    let (status, content_type, body) = match path {
        "/healthz" => (StatusCode::OK, "text/plain", Body::from("ok\n")),
        "/readyz" if ready.load(Ordering::Acquire) => {
            (StatusCode::OK, "text/plain", Body::from("ready\n"))
        }
        "/readyz" => (
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain",
            Body::from("not ready\n"),
        ),
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(metrics::encode_metrics()),
        ),
        _ => (StatusCode::NOT_FOUND, "text/plain", Body::from("not found\n")),
    };

    if status != StatusCode::NOT_FOUND {
        audit::admin_http_request(path, status.as_u16());
    }

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str, ready: bool) -> Response<Body> {
        let req = Request::get(path).body(Body::empty()).unwrap();
        handle(&req, &AtomicBool::new(ready))
    }

    #[tokio::test]
    async fn test_admin_routes() {
        assert_eq!(get("/healthz", false).status(), StatusCode::OK);
        assert_eq!(get("/readyz", false).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get("/readyz", true).status(), StatusCode::OK);
        assert_eq!(get("/nope", true).status(), StatusCode::NOT_FOUND);

        let metrics = get("/metrics", true);
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(metrics.into_body()).await.unwrap();
        assert!(std::str::from_utf8(&body).is_ok());
    }
}
