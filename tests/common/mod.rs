//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rewroute::{InterceptorConfig, Interceptor, StartOptions};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const ORIGINAL_HOSTS: &str = "127.0.0.1 localhost\n::1 localhost ip6-localhost\n# managed by hand\n";

/// A throwaway hosts file plus a config that points at it.
pub struct Sandbox {
    pub dir: TempDir,
    pub hosts: PathBuf,
    pub config: InterceptorConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, ORIGINAL_HOSTS).unwrap();

        let mut config = InterceptorConfig::default();
        config.listener.bind_address = "127.0.0.1".into();
        config.listener.ports = vec![0];
        config.name_override.hosts_path = hosts.to_string_lossy().into_owned();
        config.name_override.flush_resolver_cache = false;
        config.upstream.max_retries = 0;
        config.upstream.request_timeout_secs = 5;
        config.timeouts.drain_grace_secs = 2;

        Self { dir, hosts, config }
    }

    pub fn hosts_content(&self) -> String {
        std::fs::read_to_string(&self.hosts).unwrap()
    }
}

/// Start `interceptor` on a free local port, optionally writing hosts entries.
pub async fn start(interceptor: &Interceptor, apply_name_override: bool) -> SocketAddr {
    let bound = interceptor
        .start(StartOptions {
            domain: None,
            ports: vec![0],
            apply_name_override,
        })
        .await
        .unwrap();
    bound[0]
}

/// Client that reaches `domain` at the interceptor's address.
pub fn client_for(domain: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .resolve(domain, addr)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Client that sends absolute-form requests through the interceptor.
pub fn proxied_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .proxy(reqwest::Proxy::http(format!("http://{}", addr)).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Raw requests seen by a mock backend.
pub type Recorded = Arc<Mutex<Vec<String>>>;

/// Start a mock backend that answers every request with `response` and
/// records what it received.
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) -> Recorded {
    let listener = TcpListener::bind(addr).await.unwrap();
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let seen = recorded.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        let request = read_request(&mut socket).await;
                        seen.lock().unwrap().push(request);
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    recorded
}

/// Start a backend that accepts connections and never answers.
pub async fn start_silent_backend(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
}

/// Read one request head plus its Content-Length body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Send raw bytes and read until the server closes the connection.
pub async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Header names of a raw HTTP message, lowercased.
pub fn header_names(message: &str) -> Vec<String> {
    message
        .split("\r\n\r\n")
        .next()
        .unwrap_or("")
        .lines()
        .skip(1)
        .filter_map(|l| l.split_once(':').map(|(name, _)| name.trim().to_ascii_lowercase()))
        .collect()
}
