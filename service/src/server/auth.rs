//! Bearer token authentication
//!
//! The server checks `authorization: Bearer <token>` metadata with an
//! interceptor; clients attach the same header with [`bearer_value`].

use crate::audit;
use std::sync::Arc;
use tonic::metadata::errors::InvalidMetadataValue;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Status};

pub const AUTHORIZATION: &str = "authorization";

/// Create a tonic interceptor that validates bearer tokens.
///
/// A `None` or empty token disables authentication.
pub fn make_auth_interceptor(
    expected_token: Option<String>,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    let expected: Option<Arc<str>> = expected_token
        .filter(|t| !t.is_empty())
        .map(Arc::from);

    move |req: Request<()>| {
        let Some(expected) = expected.as_deref() else {
            audit::grpc_auth_success();
            return Ok(req);
        };
        match check_bearer(&req, expected) {
            Ok(()) => {
                audit::grpc_auth_success();
                Ok(req)
            }
            Err(reason) => {
                audit::grpc_auth_failure(reason);
                Err(Status::unauthenticated(reason))
            }
        }
    }
}

fn check_bearer(req: &Request<()>, expected: &str) -> Result<(), &'static str> {
    let value = req
        .metadata()
        .get(AUTHORIZATION)
        .ok_or("missing authorization header")?;
    let value = value
        .to_str()
        .map_err(|_| "invalid authorization header encoding")?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or("missing Bearer prefix")?;
    if token == expected {
        Ok(())
    } else {
        Err("invalid token")
    }
}

/// Metadata value a client sends to authenticate with `token`.
pub fn bearer_value(token: &str) -> Result<MetadataValue<Ascii>, InvalidMetadataValue> {
    format!("Bearer {}", token).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(header: Option<&str>) -> Request<()> {
        let mut req = Request::new(());
        if let Some(h) = header {
            req.metadata_mut().insert(AUTHORIZATION, h.parse().unwrap());
        }
        req
    }

    #[test]
    fn test_auth_disabled() {
        let mut interceptor = make_auth_interceptor(None);
        assert!(interceptor(request_with(None)).is_ok());

        let mut interceptor = make_auth_interceptor(Some(String::new()));
        assert!(interceptor(request_with(None)).is_ok());
    }

    #[test]
    fn test_valid_token() {
        let mut interceptor = make_auth_interceptor(Some("secret123".to_string()));
        let value = bearer_value("secret123").unwrap();
        let mut req = Request::new(());
        req.metadata_mut().insert(AUTHORIZATION, value);
        assert!(interceptor(req).is_ok());
    }

    #[test]
    fn test_rejections() {
        let mut interceptor = make_auth_interceptor(Some("secret123".to_string()));
        for (header, reason) in [
            (Some("Bearer wrong"), "invalid token"),
            (None, "missing authorization header"),
            (Some("secret123"), "missing Bearer prefix"),
        ] {
            let err = interceptor(request_with(header)).unwrap_err();
            assert_eq!(err.code(), tonic::Code::Unauthenticated);
            assert_eq!(err.message(), reason);
        }
    }
}
