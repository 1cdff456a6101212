//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, method, path)
//!     → router.rs (domain lookup in DomainRegistry)
//!     → matcher.rs (structural template match, then method filter)
//!     → Return: Local { route, params } | MethodNotAllowed | NoMatch
//!
//! Registration (before serving):
//!     RouteTable::add(template, methods, handler)
//!     → template.rs (parse literal / <param> segments)
//!     → DomainRegistry::register(domain, table)
//!     → frozen into Arc<DomainRegistry> at start
//! ```
//!
//! # Design Decisions
//! - Routes are immutable while serving (thread-safe without locks)
//! - No regex in the hot path
//! - Deterministic: same input always matches same route
//! - Explicit NoMatch rather than silent default

pub mod domain;
pub mod matcher;
pub mod router;
pub mod template;

pub use domain::{Domain, DomainError};
pub use matcher::{MatchResult, RouteMatcher};
pub use router::{DomainRegistry, Route, RouteHandle, RouteTable};
pub use template::{Params, PathTemplate, TemplateError};
