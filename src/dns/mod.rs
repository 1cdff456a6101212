//! Name resolution in both directions.
//!
//! `hosts` points intercepted domains at the local listener; `resolver`
//! finds the real origin when a request has to be forwarded.

pub mod hosts;
pub mod resolver;

pub use hosts::{NameOverrideManager, OverrideError, OverrideRecord};
pub use resolver::UpstreamResolver;
