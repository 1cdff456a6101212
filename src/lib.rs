//! Local traffic interception.
//!
//! Chosen domains are pointed at a local listener through the hosts file.
//! Requests for those domains are answered by registered handlers; everything
//! else is forwarded to the real origin, resolved through public nameservers.
//!
//! ```text
//!   client ──▶ net::Listener ──▶ http::server ──▶ routing::RouteMatcher
//!                                     │                 │
//!                                     │        local ◀──┴──▶ no match
//!                                     ▼                        ▼
//!                              http::handler          http::forward ──▶ origin
//!
//!   lifecycle::Interceptor: dns::hosts apply → bind → serve → drain → restore
//! ```

pub mod config;
pub mod dns;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod sites;

pub use config::schema::InterceptorConfig;
pub use http::{Handler, HandlerError, HandlerResult, IncomingRequest, OutgoingResponse, Reply};
pub use lifecycle::{Interceptor, InterceptorError, ListenerState, StartOptions};
pub use routing::{Domain, Params, RouteTable};
