//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → server.rs (hyper http1, tower layers, catch-all handler)
//!     → request.rs (host, path, buffered body)
//!     → routing::RouteMatcher
//!         → handler.rs (local dispatch, reply normalization)
//!         → forward.rs (relay to the real origin)
//!     → response.rs (hop-by-hop cleanup, serialize)
//! ```

pub mod forward;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;

pub use forward::{ForwardError, UpstreamForwarder};
pub use handler::{Handler, HandlerError, HandlerResult, Reply};
pub use request::{IncomingRequest, RequestError};
pub use response::OutgoingResponse;
pub use server::{build_router, serve, AppState, ServeSettings};
