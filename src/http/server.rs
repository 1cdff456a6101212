//! HTTP server setup and per-request dispatch.
//!
//! # Responsibilities
//! - Create the Axum router with one catch-all handler
//! - Wire up middleware (tracing, request ID, timeout, body limit)
//! - Serve each accepted connection with hyper's HTTP/1.1 server
//! - Decide per request: local handler, local 404/405, or upstream forward
//! - Drain connections gracefully when told to stop
//!
//! # Design Decisions
//! - One task per connection, owned by a `JoinSet` so a drain can abort
//!   whatever outlives the grace period
//! - The registry is frozen behind an `Arc` while serving; workers only read

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{request::Parts, uri::Authority, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{InterceptorConfig, UnmatchedPolicy, UpstreamScheme};
use crate::http::forward::UpstreamForwarder;
use crate::http::handler::dispatch;
use crate::http::request::IncomingRequest;
use crate::http::response::OutgoingResponse;
use crate::net::{ConnectionGuard, ConnectionPermit, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics::{self, Outcome};
use crate::routing::domain::host_from_authority;
use crate::routing::{MatchResult, RouteMatcher};
use crate::security::limits::{read_body, BodyError};

/// Everything a request worker needs, shared read-only.
#[derive(Clone)]
pub struct AppState {
    matcher: Arc<RouteMatcher>,
    forwarder: Arc<UpstreamForwarder>,
    unmatched: UnmatchedPolicy,
    max_body_size: usize,
    upstream_scheme: UpstreamScheme,
    /// Addresses this interceptor listens on, for loop detection.
    bound: Arc<[SocketAddr]>,
}

impl AppState {
    pub fn new(
        matcher: RouteMatcher,
        forwarder: UpstreamForwarder,
        config: &InterceptorConfig,
        bound: Vec<SocketAddr>,
    ) -> Self {
        Self {
            matcher: Arc::new(matcher),
            forwarder: Arc::new(forwarder),
            unmatched: config.routing.unmatched,
            max_body_size: config.security.max_body_size,
            upstream_scheme: config.upstream.scheme,
            bound: bound.into(),
        }
    }

    /// Answer one request. Never fails: every error becomes a response.
    pub async fn handle(
        &self,
        parts: Parts,
        body: Body,
        peer: Option<SocketAddr>,
    ) -> (OutgoingResponse, Outcome) {
        let body = match read_body(body, self.max_body_size).await {
            Ok(body) => body,
            Err(BodyError::TooLarge { limit }) => {
                tracing::debug!(limit, "Request body too large");
                return (
                    OutgoingResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
                    Outcome::Rejected,
                );
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read request body");
                return (OutgoingResponse::bad_request(&e.to_string()), Outcome::Rejected);
            }
        };

        let request = match IncomingRequest::from_parts(parts, body, peer) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting request");
                return (OutgoingResponse::bad_request(&e.to_string()), Outcome::Rejected);
            }
        };

        if let Some(domain) = request.domain() {
            match self
                .matcher
                .match_request(domain, request.method(), request.path())
            {
                MatchResult::Local { route, params, .. } => {
                    tracing::debug!(
                        domain = %domain,
                        method = %request.method(),
                        path = %request.path(),
                        template = %route.template(),
                        "Dispatching locally"
                    );
                    let response = dispatch(route.handler(), request, params).await;
                    return (response, Outcome::Local);
                }
                MatchResult::MethodNotAllowed { allowed } => {
                    return (
                        OutgoingResponse::method_not_allowed(&allowed),
                        Outcome::MethodNotAllowed,
                    );
                }
                MatchResult::NoMatch
                    if self.unmatched == UnmatchedPolicy::NotFound
                        && self.matcher.registry().contains(domain) =>
                {
                    return (OutgoingResponse::not_found(), Outcome::NotFound);
                }
                MatchResult::NoMatch => {}
            }
        }

        if self.targets_self(&request) {
            tracing::warn!(host = %request.host(), "Refusing to forward a request back to the interceptor");
            return (
                OutgoingResponse::error(StatusCode::LOOP_DETECTED, "request targets the interceptor itself"),
                Outcome::Rejected,
            );
        }

        tracing::debug!(
            host = %request.host(),
            method = %request.method(),
            path = %request.path(),
            "Forwarding upstream"
        );
        match self.forwarder.forward(&request).await {
            Ok(response) => (response, Outcome::Forward),
            Err(e) => {
                tracing::warn!(host = %request.host(), error = %e, "Upstream request failed");
                (e.into_response(), Outcome::Error)
            }
        }
    }

    /// Whether forwarding would connect straight back to one of our sockets,
    /// or the request already passed through our forwarder once.
    fn targets_self(&self, request: &IncomingRequest) -> bool {
        if self.forwarder.has_relayed(request.headers()) {
            return true;
        }

        let default_port = match self.upstream_scheme {
            UpstreamScheme::Http => 80,
            UpstreamScheme::Https => 443,
        };
        let port = Authority::from_str(request.host())
            .ok()
            .and_then(|a| a.port_u16())
            .unwrap_or(default_port);
        let listening: Vec<IpAddr> = self
            .bound
            .iter()
            .filter(|addr| addr.port() == port)
            .map(SocketAddr::ip)
            .collect();
        if listening.is_empty() {
            return false;
        }

        let host = host_from_authority(request.host());
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        let Ok(ip) = host.parse::<IpAddr>() else {
            return false;
        };
        if ip.is_loopback() || ip.is_unspecified() || listening.contains(&ip) {
            return true;
        }
        // a wildcard bind listens on every interface address
        listening.iter().any(|bound| bound.is_unspecified()) && is_local_address(ip)
    }
}

/// Whether `ip` belongs to one of this machine's interfaces: only local
/// addresses can be bound.
fn is_local_address(ip: IpAddr) -> bool {
    std::net::UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(config: &InterceptorConfig, state: AppState) -> Router {
    Router::new()
        .route("/", any(intercept_handler))
        .route("/{*path}", any(intercept_handler))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn intercept_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();

    let (parts, body) = request.into_parts();
    let (response, outcome) = state.handle(parts, body, Some(peer)).await;

    tracing::info!(
        method = %method,
        status = response.status().as_u16(),
        outcome = outcome.as_str(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );
    metrics::record_request(method.as_str(), response.status().as_u16(), outcome, start);

    response.into_response()
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ServeSettings {
    pub header_read_timeout: Duration,
    pub drain_grace: Duration,
}

impl ServeSettings {
    pub fn from_config(config: &InterceptorConfig) -> Self {
        Self {
            header_read_timeout: Duration::from_secs(config.listener.header_read_timeout_secs),
            drain_grace: Duration::from_secs(config.timeouts.drain_grace_secs),
        }
    }
}

/// Accept and serve connections on `listener` until `shutdown` turns true,
/// then drain. Connections still open after the grace period are aborted.
pub async fn serve(
    listener: Listener,
    router: Router,
    tracker: ConnectionTracker,
    mut shutdown: watch::Receiver<bool>,
    settings: ServeSettings,
) {
    let local_addr = listener.local_addr().ok();
    let connection_shutdown = shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let guard = tracker.track();
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        permit,
                        guard,
                        router.clone(),
                        connection_shutdown.clone(),
                        settings.header_read_timeout,
                    ));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    // usually fd exhaustion; back off instead of spinning
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // closing the socket refuses new connections right away
    drop(listener);
    tracing::info!(
        address = ?local_addr,
        in_flight = connections.len(),
        "Listener draining"
    );

    let deadline = tokio::time::Instant::now() + settings.drain_grace;
    let drained = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            address = ?local_addr,
            remaining = connections.len(),
            "Drain grace period elapsed, closing connections"
        );
        connections.shutdown().await;
    }
    tracing::info!(address = ?local_addr, "Listener stopped");
}

/// Resolves once `shutdown` turns true or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
    header_read_timeout: Duration,
) {
    let connection_id = guard.id();
    let service = router.map_request(move |request: Request<Incoming>| {
        let mut request = request.map(Body::new);
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .keep_alive(true);
    let connection = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection_id, peer_addr = %peer, error = %e, "Connection error");
            }
        }
        _ = stopped(&mut shutdown) => {
            // finish the in-flight request, then close
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                tracing::debug!(connection_id = %connection_id, error = %e, "Connection error while draining");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::http::handler::{HandlerResult, Reply};
    use crate::routing::{Domain, DomainRegistry, Params, RouteTable};
    use axum::http::{header, Method};

    async fn show_item(_req: IncomingRequest, params: Params) -> HandlerResult {
        Ok(Reply::text(format!("item {}", params.get("id").unwrap_or("?"))))
    }

    fn state(unmatched: UnmatchedPolicy, bound: Vec<SocketAddr>) -> AppState {
        let mut routes = RouteTable::new();
        routes.get("/item/<id>", show_item).unwrap();
        let mut registry = DomainRegistry::new();
        registry.register(Domain::parse("shop.local").unwrap(), routes);

        let mut config = InterceptorConfig::default();
        config.routing.unmatched = unmatched;
        config.security.max_body_size = 16;
        let forwarder = UpstreamForwarder::new(&UpstreamConfig {
            max_retries: 0,
            ..UpstreamConfig::default()
        })
        .unwrap();
        AppState::new(RouteMatcher::new(Arc::new(registry)), forwarder, &config, bound)
    }

    fn parts(method: Method, uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn local_match_dispatches() {
        let state = state(UnmatchedPolicy::Forward, vec![]);
        let (response, outcome) = state
            .handle(parts(Method::GET, "/item/42", Some("shop.local")), Body::empty(), None)
            .await;
        assert_eq!(outcome, Outcome::Local);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"item 42");
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let state = state(UnmatchedPolicy::Forward, vec![]);
        let (response, outcome) = state
            .handle(parts(Method::POST, "/item/42", Some("shop.local")), Body::empty(), None)
            .await;
        assert_eq!(outcome, Outcome::MethodNotAllowed);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unmatched_path_can_be_404() {
        let state = state(UnmatchedPolicy::NotFound, vec![]);
        let (response, outcome) = state
            .handle(parts(Method::GET, "/item/42/extra", Some("shop.local")), Body::empty(), None)
            .await;
        assert_eq!(outcome, Outcome::NotFound);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_host_is_400() {
        let state = state(UnmatchedPolicy::Forward, vec![]);
        let (response, outcome) = state
            .handle(parts(Method::GET, "/", None), Body::empty(), None)
            .await;
        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let state = state(UnmatchedPolicy::Forward, vec![]);
        let (response, _) = state
            .handle(
                parts(Method::POST, "/item/1", Some("shop.local")),
                Body::from("this body is longer than sixteen bytes"),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn forwarding_to_ourselves_is_refused() {
        let bound: SocketAddr = "127.0.0.1:18080".parse().unwrap();
        let state = state(UnmatchedPolicy::Forward, vec![bound]);
        let (response, _) = state
            .handle(parts(Method::GET, "/", Some("127.0.0.1:18080")), Body::empty(), None)
            .await;
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);

        let (response, _) = state
            .handle(parts(Method::GET, "/", Some("localhost:18080")), Body::empty(), None)
            .await;
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn serve_can_run_on_any_worker() {
        let config = InterceptorConfig::default();
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(tokio::sync::Semaphore::new(4)),
        )
        .await
        .unwrap();
        let (stop, rx) = watch::channel(false);
        let serving = serve(
            listener,
            build_router(&config, state(UnmatchedPolicy::Forward, vec![])),
            ConnectionTracker::new(),
            rx,
            ServeSettings::from_config(&config),
        );
        assert_send(&serving);

        let task = tokio::spawn(serving);
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wildcard_bind_covers_interface_addresses() {
        let bound: SocketAddr = "0.0.0.0:18081".parse().unwrap();
        let state = state(UnmatchedPolicy::Forward, vec![bound]);

        // the address the kernel would route outbound traffic from; no packet is sent
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let interface = match socket.connect("198.51.100.1:9").and_then(|_| socket.local_addr()) {
            Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
            _ => IpAddr::from([127, 0, 0, 1]),
        };
        let host = SocketAddr::new(interface, 18081).to_string();
        let (response, _) = state
            .handle(parts(Method::GET, "/", Some(host.as_str())), Body::empty(), None)
            .await;
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);

        assert!(is_local_address(interface));
        assert!(!is_local_address("203.0.113.77".parse().unwrap()));
    }
}
