//! Relaying requests to the real origin.
//!
//! # Responsibilities
//! - Resolve the origin with [`UpstreamResolver`], never the hosts file
//! - Replay method, path, query and body; drop hop-by-hop headers both ways
//! - Hold every attempt to one absolute deadline
//! - Retry idempotent requests that never reached the origin
//! - Stamp a `Via` entry unique to this forwarder so a request that comes
//!   back around can be recognised
//!
//! # Design Decisions
//! - Redirects are relayed to the client, never followed
//! - Bodies are not decompressed or re-encoded
//! - Upstream bodies are buffered up to `max_response_body`

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::BytesMut;

use crate::config::{UpstreamConfig, UpstreamScheme};
use crate::dns::UpstreamResolver;
use crate::http::request::IncomingRequest;
use crate::http::response::OutgoingResponse;
use crate::observability::metrics;
use crate::resilience::{Deadline, RetryPolicy};
use crate::routing::Domain;
use crate::security::headers::strip_hop_by_hop;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("upstream {host} unreachable: {message}")]
    Unreachable {
        host: String,
        message: String,
        /// No byte of the request reached the origin.
        before_send: bool,
    },
    #[error("cannot build upstream URL for host {0:?}")]
    InvalidTarget(String),
    #[error("upstream response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
    #[error("failed to build upstream client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ForwardError {
    /// Status sent to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ForwardError::Unreachable { .. }
            | ForwardError::ResponseTooLarge { .. }
            | ForwardError::Build(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Label for `rewroute_upstream_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Unreachable { before_send: true, .. } => "connect",
            ForwardError::Unreachable { .. } => "io",
            ForwardError::InvalidTarget(_) => "invalid_target",
            ForwardError::ResponseTooLarge { .. } => "too_large",
            ForwardError::Build(_) => "client",
        }
    }

    pub fn into_response(self) -> OutgoingResponse {
        let detail = match &self {
            ForwardError::Timeout(_) => "upstream timed out".to_string(),
            other => other.to_string(),
        };
        OutgoingResponse::error(self.status(), &detail)
    }
}

/// Sends requests to their real origin.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    client: reqwest::Client,
    scheme: UpstreamScheme,
    timeout: Duration,
    retry: RetryPolicy,
    max_response_body: usize,
    /// Our `Via` pseudonym, e.g. `rewroute-5e1f09a2`.
    via_name: String,
}

impl UpstreamForwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ForwardError> {
        let mut resolver = UpstreamResolver::new(config.nameservers);
        for (host, addr) in &config.pinned {
            match (Domain::parse(host), addr.parse()) {
                (Ok(domain), Ok(ip)) => resolver = resolver.pin(domain, ip),
                _ => tracing::warn!(host = %host, addr = %addr, "Ignoring invalid pinned upstream"),
            }
        }

        if !config.verify_tls {
            tracing::warn!("Upstream TLS certificate verification is disabled (upstream.verify_tls = false)");
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!config.verify_tls)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .dns_resolver(Arc::new(resolver))
            .no_proxy()
            .build()
            .map_err(ForwardError::Build)?;

        Ok(Self {
            client,
            scheme: config.scheme,
            timeout: Duration::from_secs(config.request_timeout_secs),
            retry: RetryPolicy::from_config(config),
            max_response_body: config.max_response_body,
            via_name: format!("rewroute-{:08x}", rand::random::<u32>()),
        })
    }

    /// Override the end-to-end deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `headers` carry a `Via` entry this forwarder stamped, i.e. the
    /// request already went out through us once.
    pub fn has_relayed(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(header::VIA)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|entry| entry.split_whitespace().nth(1))
            .any(|name| name == self.via_name)
    }

    /// Relay `request` to its origin. Never takes longer than the configured
    /// timeout.
    pub async fn forward(&self, request: &IncomingRequest) -> Result<OutgoingResponse, ForwardError> {
        let deadline = Deadline::after(self.timeout);
        let url = self.target_url(request)?;

        let mut headers = request.headers().clone();
        strip_hop_by_hop(&mut headers);
        // derived from the URL and body
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let Ok(via) = HeaderValue::from_str(&format!("1.1 {}", self.via_name)) {
            headers.append(header::VIA, via);
        }

        let mut attempt = 0;
        loop {
            let outbound = self
                .client
                .request(request.method().clone(), url.clone())
                .headers(headers.clone())
                .body(request.body().clone());

            let error = match deadline.run(self.exchange(outbound, request.host())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => return Err(self.record(ForwardError::Timeout(self.timeout))),
            };

            let before_send = matches!(error, ForwardError::Unreachable { before_send: true, .. });
            if !self.retry.should_retry(request.method(), attempt, before_send) {
                return Err(self.record(error));
            }
            attempt += 1;
            let delay = self.retry.delay(attempt);
            if delay >= deadline.remaining() {
                return Err(self.record(error));
            }
            tracing::info!(
                host = %request.host(),
                attempt,
                delay = ?delay,
                error = %error,
                "Retrying upstream after connect failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn exchange(
        &self,
        outbound: reqwest::RequestBuilder,
        host: &str,
    ) -> Result<OutgoingResponse, ForwardError> {
        let mut response = outbound.send().await.map_err(|e| classify(e, host, self.timeout))?;
        let status = response.status();

        if let Some(len) = response.content_length() {
            if len > self.max_response_body as u64 {
                return Err(ForwardError::ResponseTooLarge {
                    limit: self.max_response_body,
                });
            }
        }

        let mut headers: HeaderMap = response.headers().clone();
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(e, host, self.timeout))? {
            if body.len() + chunk.len() > self.max_response_body {
                return Err(ForwardError::ResponseTooLarge {
                    limit: self.max_response_body,
                });
            }
            body.extend_from_slice(&chunk);
        }

        strip_hop_by_hop(&mut headers);
        tracing::debug!(host, status = status.as_u16(), bytes = body.len(), "Upstream responded");
        Ok(OutgoingResponse::from_parts(status, headers, body.freeze()))
    }

    fn target_url(&self, request: &IncomingRequest) -> Result<reqwest::Url, ForwardError> {
        let raw = format!("{}://{}{}", self.scheme.as_str(), request.host(), request.path_and_query());
        reqwest::Url::parse(&raw).map_err(|_| ForwardError::InvalidTarget(request.host().to_string()))
    }

    fn record(&self, error: ForwardError) -> ForwardError {
        metrics::upstream_error(error.kind());
        error
    }
}

fn classify(error: reqwest::Error, host: &str, timeout: Duration) -> ForwardError {
    if error.is_timeout() {
        return ForwardError::Timeout(timeout);
    }
    ForwardError::Unreachable {
        host: host.to_string(),
        message: error_chain(&error),
        before_send: error.is_connect(),
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
