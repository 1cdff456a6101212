//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! start (interceptor.rs):
//!     Idle → Binding: apply hosts overrides → bind ports (rollback on failure)
//!     Binding → Serving: spawn one accept loop per port
//!
//! stop (interceptor.rs, shutdown.rs):
//!     Serving → Draining: stop accepting → drain within grace → abort stragglers
//!     Draining → Idle: restore hosts file, always
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → stop
//! ```

pub mod interceptor;
pub mod shutdown;
pub mod signals;

pub use interceptor::{Interceptor, InterceptorError, ListenerState, StartOptions};
pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
