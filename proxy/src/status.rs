//! gRPC status to HTTP response translation

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use tonic::{Code, Status};

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// gRPC codes with a dedicated HTTP status.
pub const STATUS_TABLE: &[(Code, StatusCode)] = &[
    (Code::Unknown, StatusCode::INTERNAL_SERVER_ERROR),
    (Code::InvalidArgument, StatusCode::BAD_REQUEST),
    (Code::NotFound, StatusCode::NOT_FOUND),
    (Code::AlreadyExists, StatusCode::CONFLICT),
];

/// Status for codes missing from [`STATUS_TABLE`].
pub const DEFAULT_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

/// HTTP status for a gRPC code.
pub fn http_status(code: Code) -> StatusCode {
    STATUS_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map_or(DEFAULT_STATUS, |(_, status)| *status)
}

/// Plain-text error response carrying the status message.
pub fn error_response(status: &Status) -> Response<Body> {
    text_error(http_status(status.code()), status.message())
}

pub fn text_error(code: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", message)));
    *response.status_mut() = code;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(http_status(Code::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::AlreadyExists), StatusCode::CONFLICT);
        for code in [Code::Unavailable, Code::Internal, Code::Unauthenticated, Code::DeadlineExceeded] {
            assert_eq!(http_status(code), DEFAULT_STATUS);
        }
    }

    #[test]
    fn test_status_table_has_no_duplicate_codes() {
        for (i, (code, _)) in STATUS_TABLE.iter().enumerate() {
            assert!(STATUS_TABLE[i + 1..].iter().all(|(other, _)| other != code));
        }
    }

    #[tokio::test]
    async fn test_error_response_body_and_headers() {
        let response = error_response(&Status::not_found("could not find profile with name: x"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], TEXT_PLAIN);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"could not find profile with name: x\n");
    }
}
