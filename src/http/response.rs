//! Outgoing responses.
//!
//! # Responsibilities
//! - Hold the status, headers and body that go back to the client, whether
//!   produced by a local handler or relayed from upstream
//! - Build the locally generated error responses (400, 404, 405, 413, 500,
//!   502, 504) with a plain-text body
//! - Convert into an axum response for hyper to serialize
//!
//! # Design Decisions
//! - Bodies are fully buffered; hyper sets `Content-Length` from them
//! - Hop-by-hop headers are stripped on the way out regardless of origin

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::body::Body;
use bytes::Bytes;

use crate::security::headers::strip_hop_by_hop;

/// A complete response ready to be written to the client.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl OutgoingResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Build from parts, e.g. when relaying an upstream response.
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// A plain-text response whose body is the canonical reason phrase followed
    /// by `detail`.
    pub fn error(status: StatusCode, detail: &str) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = if detail.is_empty() {
            format!("{} {}\n", status.as_u16(), reason)
        } else {
            format!("{} {}: {}\n", status.as_u16(), reason, detail)
        };
        Self::new(status)
            .with_mimetype("text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn bad_request(detail: &str) -> Self {
        Self::error(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, "")
    }

    /// 405 with an `Allow` header listing `allowed`.
    pub fn method_not_allowed(allowed: &[Method]) -> Self {
        let allow = allowed
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut response = Self::error(StatusCode::METHOD_NOT_ALLOWED, "");
        if let Ok(value) = HeaderValue::from_str(&allow) {
            response.headers.insert(header::ALLOW, value);
        }
        response
    }

    pub fn internal_error() -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "the handler failed")
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header. Invalid names or values are ignored with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Ignoring invalid response header"),
        }
        self
    }

    /// Set the `Content-Type`.
    pub fn with_mimetype(mut self, mimetype: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(mimetype) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl IntoResponse for OutgoingResponse {
    fn into_response(self) -> Response {
        let OutgoingResponse {
            status,
            mut headers,
            body,
        } = self;
        strip_hop_by_hop(&mut headers);
        // A non-empty buffered body is the authority and hyper recomputes
        // framing from it. An empty one keeps the origin's length, which is
        // what a HEAD response advertises.
        if !body.is_empty() {
            headers.remove(header::CONTENT_LENGTH);
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_names_the_status() {
        let r = OutgoingResponse::error(StatusCode::BAD_GATEWAY, "upstream refused");
        assert_eq!(r.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(r.body().as_ref(), b"502 Bad Gateway: upstream refused\n");
        assert_eq!(
            r.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn method_not_allowed_lists_methods() {
        let r = OutgoingResponse::method_not_allowed(&[Method::GET, Method::HEAD]);
        assert_eq!(r.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(r.headers().get(header::ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn conversion_strips_hop_by_hop() {
        let r = OutgoingResponse::new(StatusCode::OK)
            .with_header("connection", "close")
            .with_header("transfer-encoding", "chunked")
            .with_header("content-length", "999")
            .with_header("x-kept", "yes")
            .with_body("ok");
        let response = r.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get("x-kept").unwrap(), "yes");
    }

    #[test]
    fn empty_body_keeps_origin_length() {
        let response = OutgoingResponse::new(StatusCode::OK)
            .with_header("content-length", "1234")
            .into_response();
        assert_eq!(response.headers().get("content-length").unwrap(), "1234");
    }

    #[test]
    fn invalid_header_is_ignored() {
        let r = OutgoingResponse::new(StatusCode::OK).with_header("bad name", "v");
        assert!(r.headers().is_empty());
    }
}
