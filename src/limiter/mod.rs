//! Rate limiting module
//!
//! A single windowed-limiter contract with pluggable backends: a
//! process-local window for single-node runs and tests, and a shared
//! Redis window so every process in the cluster charges against the same
//! budget. The compute-budget limiter layers adaptive baseline estimation
//! on top of the same contract.

mod compute;
mod window;

pub use compute::{BaselineProbe, BudgetVerdict, ComputeBudgetLimiter, ComputeOptions};
pub use window::{MemoryRateLimiter, RedisRateLimiter};

use std::time::Duration;

use crate::error::LimiterError;

/// Result of charging an amount against a keyed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitCheck {
    /// Total charged in the current window, including this call
    pub current: u64,
    /// Configured window limit
    pub limit: u64,
    /// Configured window length
    pub window: Duration,
    /// Whether the window limit is now exceeded
    pub over: bool,
}

impl LimitCheck {
    /// Headroom left in the window
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    /// Amount charged beyond the limit
    pub fn overage(&self) -> u64 {
        self.current.saturating_sub(self.limit)
    }
}

/// Windowed rate limiter contract.
///
/// `check` charges `amount` units against the window for `key` and
/// reports the resulting state; it never blocks waiting for capacity.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str, amount: u64) -> Result<LimitCheck, LimiterError>;
}
