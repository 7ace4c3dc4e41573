//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use modpack_core::error::{PackError, Result};
use tokio_util::sync::CancellationToken;

/// Attempts made before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 4;

/// Delay before the first retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(10);

/// Maximum delay between attempts (cap).
pub const MAX_BACKOFF: Duration = Duration::from_secs(20);

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts or `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(PackError::Cancelled);
            }

            let err = tokio::select! {
                _ = cancel.cancelled() => return Err(PackError::Cancelled),
                result = op() => match result {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                },
            };

            if !err.is_retryable() || attempt >= self.attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                what,
                attempt,
                max_attempts = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PackError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
