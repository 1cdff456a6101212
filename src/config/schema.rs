//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the interceptor.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Listener configuration (bind address, ports).
    pub listener: ListenerConfig,

    /// Hosts-file override settings.
    pub name_override: NameOverrideConfig,

    /// Forwarding to the real origin.
    pub upstream: UpstreamConfig,

    /// What to do with requests that match no route.
    pub routing: RoutingConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request size limits.
    pub security: SecurityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Canned local sites served by the command-line binary.
    pub sites: Vec<SiteConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "0.0.0.0").
    pub bind_address: String,

    /// Ports to listen on. Port 80 needs elevated privileges on most systems.
    pub ports: Vec<u16>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Time allowed for a client to send the request head.
    pub header_read_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            ports: vec![80],
            max_connections: 10_000,
            header_read_timeout_secs: 30,
        }
    }
}

/// Hosts-file override configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NameOverrideConfig {
    /// Write hosts entries for registered domains on start.
    pub enabled: bool,

    /// Path of the hosts file.
    pub hosts_path: String,

    /// Address registered domains are pointed at.
    pub target_address: String,

    /// Ask the OS resolver cache to flush after each write (best effort).
    pub flush_resolver_cache: bool,
}

impl Default for NameOverrideConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts_path: default_hosts_path().to_string(),
            target_address: "127.0.0.1".to_string(),
            flush_resolver_cache: true,
        }
    }
}

/// Platform hosts file location.
pub fn default_hosts_path() -> &'static str {
    if cfg!(windows) {
        r"C:\Windows\System32\drivers\etc\hosts"
    } else {
        "/etc/hosts"
    }
}

/// Scheme used when talking to the real origin.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }
}

/// Public resolvers used for true name resolution.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Nameservers {
    #[default]
    Cloudflare,
    Google,
    Quad9,
}

/// Upstream forwarding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Scheme for forwarded requests.
    pub scheme: UpstreamScheme,

    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Absolute deadline for one forwarded request, retries included.
    pub request_timeout_secs: u64,

    /// Verify upstream TLS certificates. Off by default so self-signed and
    /// local origins keep working; set to true to enforce verification.
    pub verify_tls: bool,

    /// Resolvers used to find the real origin, bypassing the hosts file.
    pub nameservers: Nameservers,

    /// Largest upstream body relayed, in bytes.
    pub max_response_body: usize,

    /// Extra attempts for idempotent requests after a connect failure.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Origin hosts answered with a fixed address instead of a DNS query.
    pub pinned: BTreeMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: UpstreamScheme::Http,
            connect_timeout_ms: 5_000,
            request_timeout_secs: 30,
            verify_tls: false,
            nameservers: Nameservers::Cloudflare,
            max_response_body: 16 * 1024 * 1024,
            max_retries: 1,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            pinned: BTreeMap::new(),
        }
    }
}

/// Policy for a registered domain whose routes do not match the path.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Forward to the real origin.
    #[default]
    Forward,
    /// Answer 404 locally.
    NotFound,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    pub unmatched: UnmatchedPolicy,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Cap on handling one request end to end, in seconds.
    pub request_secs: u64,

    /// How long in-flight connections may run after stop() before being
    /// force-closed.
    pub drain_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 60,
            drain_grace_secs: 5,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A canned site: a domain and fixed responses for some paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub domain: String,

    #[serde(default)]
    pub routes: Vec<CannedRouteConfig>,
}

/// One canned route. `{name}` in `body` is replaced by the bound parameter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CannedRouteConfig {
    pub path: String,

    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default)]
    pub body: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/html; charset=utf-8".to_string()
}
