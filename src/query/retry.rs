//! Retry policy for failed query fetches.

use std::time::Duration;

/// Base delay for the first retry before doubling.
const BASE_DELAY_MS: u64 = 1000;

/// Upper bound on any single retry delay.
const MAX_DELAY_MS: u64 = 30_000;

/// How many times a failed fetch is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
}

impl RetryPolicy {
  pub fn new(max_retries: u32) -> Self {
    Self { max_retries }
  }

  /// Never retry; the first failure settles the entry as an error.
  pub fn none() -> Self {
    Self { max_retries: 0 }
  }

  /// Delay before retry number `attempt` (starting at 1):
  /// `min(1000 * 2^attempt, 30000)` milliseconds.
  pub fn delay(&self, attempt: u32) -> Duration {
    let ms = 2u64
      .checked_pow(attempt)
      .and_then(|factor| factor.checked_mul(BASE_DELAY_MS))
      .map_or(MAX_DELAY_MS, |ms| ms.min(MAX_DELAY_MS));
    Duration::from_millis(ms)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_retries: 3 }
  }
}
