//! Shared retry/backoff policy
//!
//! One backoff law for everything that reconnects: peer sessions and the
//! control channel both derive their delays from the same calculator, so
//! tuning the base/cap in one place changes both.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff calculator. Pure and stateless; callers own
/// their own attempt counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay for attempt 0, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds
    pub cap_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            cap_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, cap_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            cap_delay_ms,
        }
    }

    /// Delay before retry number `attempt` (0-based):
    /// `min(base * 2^attempt, cap)`, saturating on overflow.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.cap_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt fits in the budget.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}
