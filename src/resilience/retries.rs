//! Retry policy for forwarded requests.
//!
//! # Design Decisions
//! - Only idempotent methods are retried, and only when the origin could
//!   not be reached; a request that reached the origin is never replayed
//! - Retries share the request's deadline, they never extend it

use std::time::Duration;

use axum::http::Method;
use rand::Rng;

use crate::config::UpstreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Whether a failed attempt number `attempt` (0-based) may be retried.
    pub fn should_retry(&self, method: &Method, attempt: u32, connect_failure: bool) -> bool {
        connect_failure && is_idempotent(method) && attempt < self.max_retries
    }

    /// Wait before retry number `retry` (1-based): the base delay doubled
    /// per retry, capped, plus up to 10% jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        let jitter_ms = match delay_ms / 10 {
            0 => 0,
            spread => rand::thread_rng().gen_range(0..spread),
        };
        Duration::from_millis(delay_ms + jitter_ms)
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}
