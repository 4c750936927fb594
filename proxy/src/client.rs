//! gRPC client for the diagnostics service

use crate::config::ProxyConfig;
use anyhow::{Context, Result};
use rpcprof_service::proto::pprof_client::PprofClient;
use rpcprof_service::server::auth::{bearer_value, AUTHORIZATION};
use rpcprof_shared::utils::unix_socket_path;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::service_fn;

pub type Client = PprofClient<InterceptedService<Channel, AuthHeader>>;

/// Attaches the bearer token, if any, to every call.
#[derive(Debug, Clone, Default)]
pub struct AuthHeader {
    value: Option<MetadataValue<Ascii>>,
}

impl AuthHeader {
    pub fn new(token: Option<&str>) -> Result<Self> {
        let value = token
            .filter(|t| !t.is_empty())
            .map(bearer_value)
            .transpose()
            .context("Auth token is not a valid header value")?;
        Ok(Self { value })
    }
}

impl Interceptor for AuthHeader {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(value) = &self.value {
            request.metadata_mut().insert(AUTHORIZATION, value.clone());
        }
        Ok(request)
    }
}

/// Client for the configured endpoint (`unix://path`, `host:port` or an
/// http(s) URL).
///
/// The connection is made on first use and re-established as needed, so the
/// proxy can start before the service does.
pub fn connect(config: &ProxyConfig) -> Result<Client> {
    let endpoint = config.endpoint.as_str();
    let connect_timeout = config.connect_timeout();
    let channel = match unix_socket_path(endpoint) {
        Some(path) => {
            let path = PathBuf::from(path);
            // The authority is never dialed; the connector opens the socket.
            Endpoint::try_from("http://[::]:50051")?
                .connect_timeout(connect_timeout)
                .connect_with_connector_lazy(service_fn(move |_: Uri| {
                    UnixStream::connect(path.clone())
                }))
        }
        None => Endpoint::from_shared(http_uri(endpoint))
            .with_context(|| format!("Invalid gRPC endpoint: {}", endpoint))?
            .connect_timeout(connect_timeout)
            .connect_lazy(),
    };

    let auth = AuthHeader::new(config.auth_token.as_deref())?;
    let client =
        PprofClient::with_interceptor(channel, auth).accept_compressed(CompressionEncoding::Gzip);
    if config.compress_requests {
        return Ok(client.send_compressed(CompressionEncoding::Gzip));
    }
    Ok(client)
}

fn http_uri(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_uri() {
        assert_eq!(http_uri("127.0.0.1:50051"), "http://127.0.0.1:50051");
        assert_eq!(http_uri("http://svc:50051"), "http://svc:50051");
        assert_eq!(http_uri("https://svc"), "https://svc");
    }

    #[test]
    fn test_auth_header_attached() {
        let mut auth = AuthHeader::new(Some("s3cret")).unwrap();
        let req = auth.call(Request::new(())).unwrap();
        assert_eq!(req.metadata().get(AUTHORIZATION).unwrap(), "Bearer s3cret");

        let mut none = AuthHeader::new(Some("")).unwrap();
        let req = none.call(Request::new(())).unwrap();
        assert!(req.metadata().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_auth_header_rejects_bad_token() {
        assert!(AuthHeader::new(Some("line\nbreak")).is_err());
    }

    fn config(endpoint: &str) -> ProxyConfig {
        ProxyConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        assert!(connect(&config("unix:///nonexistent/pprof.sock")).is_ok());
        assert!(connect(&config("127.0.0.1:1")).is_ok());
    }

    #[test]
    fn test_connect_rejects_bad_endpoint() {
        assert!(connect(&config("http://bad host")).is_err());
    }
}
