//! Parsed inbound requests.
//!
//! # Responsibilities
//! - Turn hyper's request parts plus the buffered body into an immutable
//!   `IncomingRequest`
//! - Work out which host the client asked for (absolute-form URI first,
//!   then the `Host` header)
//!
//! # Design Decisions
//! - Hyper rejects malformed request lines and headers before we see them
//! - A request without any usable host is a parse error (400), since neither
//!   local dispatch nor forwarding can proceed without one

use std::net::SocketAddr;

use axum::http::{header, request::Parts, HeaderMap, Method, Version};
use bytes::Bytes;

use crate::routing::Domain;

/// Reasons an otherwise well-formed HTTP request cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request has no Host header")]
    MissingHost,
    #[error("Host header is not valid: {0:?}")]
    InvalidHost(String),
}

/// An inbound request, immutable once constructed.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    host: String,
    domain: Option<Domain>,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
}

impl IncomingRequest {
    /// Build from hyper request parts and an already-buffered body.
    pub fn from_parts(
        parts: Parts,
        body: Bytes,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Self, RequestError> {
        let host = match parts.uri.authority() {
            Some(authority) => authority.as_str().to_string(),
            None => {
                let value = parts
                    .headers
                    .get(header::HOST)
                    .ok_or(RequestError::MissingHost)?;
                value
                    .to_str()
                    .map_err(|_| RequestError::InvalidHost(String::from_utf8_lossy(value.as_bytes()).into_owned()))?
                    .trim()
                    .to_string()
            }
        };
        if host.is_empty() {
            return Err(RequestError::MissingHost);
        }

        let domain = Domain::from_authority(&host);
        let path = match parts.uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            method: parts.method,
            path,
            query: parts.uri.query().map(str::to_string),
            version: parts.version,
            headers: parts.headers,
            host,
            domain,
            body,
            peer_addr,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Raw (still percent-encoded) path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Decoded query pairs, in order of appearance.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Path plus query, as it appears on the request line in origin-form.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The host the client addressed, including any port.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host as a domain name, or `None` for IP literals.
    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[cfg(test)]
pub(crate) fn test_request(method: Method, uri: &str, host: &str) -> IncomingRequest {
    let request = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, host)
        .body(())
        .unwrap();
    let (parts, ()) = request.into_parts();
    IncomingRequest::from_parts(parts, Bytes::new(), None).unwrap()
}
