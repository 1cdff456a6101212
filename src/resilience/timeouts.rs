//! Deadlines.
//!
//! A forwarded request gets one absolute deadline at entry. Every await on
//! the upstream path (connect, retries, body reads) runs against that same
//! instant, so the total time never exceeds the configured budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::{error::Elapsed, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `fut`, giving up at the deadline.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(self.at, fut).await
    }
}
