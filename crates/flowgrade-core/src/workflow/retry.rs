//! Retry decisions and backoff delays for step attempts.
//!
//! Stateless: the executor's worker tracks how many retries a step has used
//! and asks `RetryHandler` whether another one is allowed and how long to
//! wait first.

use std::time::Duration;

use flowgrade_types::workflow::{Backoff, RetryPolicy};

use super::executor::StepExecutionError;

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed attempt may be retried.
    ///
    /// `retries_used` counts retries already performed (0 after the first
    /// attempt). Cancellation and permanent action failures never retry.
    pub fn should_retry(policy: &RetryPolicy, retries_used: u32, error: &StepExecutionError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        retries_used < policy.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
        match &policy.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exponent = retry.saturating_sub(1).min(63) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let millis = (*initial_ms as f64 * factor).min(*max_ms as f64);
                Duration::from_millis(millis.max(0.0) as u64)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
