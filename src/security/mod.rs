//! Request hygiene.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (body size, 413 on overrun)
//!     → headers.rs (hop-by-hop headers stripped before forwarding)
//! Upstream response:
//!     → headers.rs (hop-by-hop headers stripped before relaying)
//! ```

pub mod headers;
pub mod limits;

pub use headers::{is_hop_by_hop, strip_hop_by_hop};
pub use limits::{read_body, BodyError};
