//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarded request:
//!     → timeouts.rs (one absolute deadline for the whole exchange)
//!     → On connect failure: retries.rs (idempotent only, jittered backoff)
//! ```

pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::Deadline;
