//! End-to-end request handling: local dispatch, forwarding, error mapping.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use rewroute::config::UnmatchedPolicy;
use rewroute::{Domain, HandlerError, HandlerResult, IncomingRequest, Interceptor, Params, Reply, RouteTable};
use serde_json::json;

mod common;

async fn show_item(_req: IncomingRequest, params: Params) -> HandlerResult {
    Ok(Reply::text(format!("item {}", params.get("id").unwrap_or("?"))))
}

async fn item_json(_req: IncomingRequest, params: Params) -> HandlerResult {
    Ok((Reply::json(json!({ "id": params.get("id") })), 201).into())
}

async fn echo(req: IncomingRequest, _params: Params) -> HandlerResult {
    Ok(Reply::text(String::from_utf8_lossy(req.body()).into_owned()))
}

async fn failing(_req: IncomingRequest, _params: Params) -> HandlerResult {
    Err(HandlerError::msg("database is on fire"))
}

async fn panicking(_req: IncomingRequest, _params: Params) -> HandlerResult {
    panic!("handler bug")
}

fn shop_routes() -> RouteTable {
    let mut routes = RouteTable::new();
    routes.get("/item/<id>", show_item).unwrap();
    routes.get("/api/item/<id>", item_json).unwrap();
    routes.post("/echo", echo).unwrap();
    routes.get("/fail", failing).unwrap();
    routes.get("/panic", panicking).unwrap();
    routes
}

async fn shop(sandbox: &common::Sandbox) -> (Interceptor, SocketAddr) {
    let mut interceptor = Interceptor::new(sandbox.config.clone());
    interceptor
        .register_domain(Domain::parse("shop.local").unwrap(), shop_routes())
        .unwrap();
    let addr = common::start(&interceptor, false).await;
    (interceptor, addr)
}

#[tokio::test]
async fn shop_scenario() {
    let mut sandbox = common::Sandbox::new();
    sandbox.config.routing.unmatched = UnmatchedPolicy::NotFound;
    let (interceptor, addr) = shop(&sandbox).await;
    let client = common::client_for("shop.local", addr);
    let base = format!("http://shop.local:{}", addr.port());

    let res = client.get(format!("{}/item/42", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    assert!(res.headers().get("x-request-id").is_some());
    assert_eq!(res.text().await.unwrap(), "item 42");

    // percent-decoded parameter
    let res = client.get(format!("{}/item/blue%20shoe", base)).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "item blue shoe");

    let res = client.get(format!("{}/api/item/7", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.headers().get("content-type").unwrap(), "application/json");
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({ "id": "7" }));

    let res = client.head(format!("{}/item/42", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.post(format!("{}/item/42", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(res.headers().get("allow").unwrap(), "GET, HEAD");

    let res = client.get(format!("{}/item/42/extra", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn handler_failures_become_500_and_serving_continues() {
    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;
    let client = common::client_for("shop.local", addr);
    let base = format!("http://shop.local:{}", addr.port());

    let res = client.get(format!("{}/fail", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = res.text().await.unwrap();
    assert!(!body.contains("database"), "internal detail leaked: {body}");

    let res = client.get(format!("{}/panic", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let res = client.get(format!("{}/item/1", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let response = common::raw_request(
        addr,
        "POST /echo HTTP/1.1\r\nHost: shop.local\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello world"), "{response}");

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn request_without_host_is_400() {
    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let response = common::raw_request(addr, "GET /item/1 HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 400") || response.starts_with("HTTP/1.1 400"), "{response}");

    let response = common::raw_request(addr, "NOT A REQUEST\r\n\r\n").await;
    assert!(response.contains(" 400 "), "{response}");

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn unregistered_host_is_forwarded_without_hop_by_hop_headers() {
    let backend: SocketAddr = "127.0.0.1:28311".parse().unwrap();
    let recorded = common::start_mock_backend(
        backend,
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close, x-hop\r\nX-Hop: secret\r\nKeep-Alive: timeout=5\r\nX-Origin: mock\r\n\r\nhello",
    )
    .await;

    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let response = common::raw_request(
        addr,
        &format!(
            "GET /catalog?page=2 HTTP/1.1\r\nHost: {}\r\nConnection: close, x-private\r\nX-Private: token\r\nKeep-Alive: 300\r\nTE: trailers\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nX-Keep: 1\r\n\r\n",
            backend
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello"));
    let names = common::header_names(&response);
    assert!(names.contains(&"x-origin".to_string()));
    assert!(!names.contains(&"x-hop".to_string()));
    assert!(!names.contains(&"keep-alive".to_string()));

    let seen = recorded.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("GET /catalog?page=2 HTTP/1.1\r\n"), "{}", seen[0]);
    let sent = common::header_names(&seen[0]);
    assert!(sent.contains(&"x-keep".to_string()));
    for hop in ["x-private", "keep-alive", "te", "proxy-authorization", "connection"] {
        assert!(!sent.contains(&hop.to_string()), "{hop} was forwarded");
    }

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn forwarding_preserves_method_query_and_body() {
    let backend: SocketAddr = "127.0.0.1:28312".parse().unwrap();
    let recorded = common::start_mock_backend(
        backend,
        "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;

    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let client = common::proxied_client(addr);
    let res = client
        .post(format!("http://{}/submit?x=1&y=two", backend))
        .body("payload=yes")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let seen = recorded.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("POST /submit?x=1&y=two HTTP/1.1\r\n"), "{}", seen[0]);
    assert!(seen[0].ends_with("\r\n\r\npayload=yes"), "{}", seen[0]);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn forwarded_head_keeps_origin_content_length() {
    let backend: SocketAddr = "127.0.0.1:28315".parse().unwrap();
    let recorded = common::start_mock_backend(
        backend,
        "HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
    )
    .await;

    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let response = common::raw_request(
        addr,
        &format!("HEAD /big HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", backend),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(
        response.to_ascii_lowercase().contains("\r\ncontent-length: 1234\r\n"),
        "{response}"
    );
    assert!(response.ends_with("\r\n\r\n"), "{response}");
    assert!(recorded.lock().unwrap()[0].starts_with("HEAD /big HTTP/1.1\r\n"));

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn request_that_loops_back_by_name_is_refused() {
    let mut sandbox = common::Sandbox::new();
    sandbox
        .config
        .upstream
        .pinned
        .insert("loop.test".into(), "127.0.0.1".into());
    let (interceptor, addr) = shop(&sandbox).await;

    let started = Instant::now();
    let response = common::raw_request(
        addr,
        &format!(
            "GET / HTTP/1.1\r\nHost: loop.test:{}\r\nConnection: close\r\n\r\n",
            addr.port()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 508"), "{response}");
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn silent_upstream_yields_gateway_timeout_within_deadline() {
    let backend: SocketAddr = "127.0.0.1:28313".parse().unwrap();
    common::start_silent_backend(backend).await;

    let mut sandbox = common::Sandbox::new();
    sandbox.config.upstream.request_timeout_secs = 1;
    let (interceptor, addr) = shop(&sandbox).await;

    let started = Instant::now();
    let res = common::proxied_client(addr)
        .get(format!("http://{}/slow", backend))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_upstream_yields_bad_gateway() {
    // nothing listens here
    let backend: SocketAddr = "127.0.0.1:28314".parse().unwrap();

    let sandbox = common::Sandbox::new();
    let (interceptor, addr) = shop(&sandbox).await;

    let res = common::proxied_client(addr)
        .get(format!("http://{}/", backend))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    interceptor.stop().await.unwrap();
}
