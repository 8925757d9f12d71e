//! Bounded retry with a fixed delay between attempts.
//!
//! Guest package installation runs through this combinator: a fixed number of
//! attempts, a fixed pause between them, and the last error returned once the
//! budget is exhausted. Guest image provisioning does not retry; it falls
//! through its ordered sources instead.

use std::future::Future;
use std::time::Duration;

/// Retry budget for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

/// Error returned once every attempt has failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// Number of attempts made.
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub last_error: E,
}

impl RetryPolicy {
    /// Create a policy; a `max_attempts` of zero is treated as one attempt.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        let attempts = if max_attempts == 0 { 1 } else { max_attempts };
        Self {
            max_attempts: attempts,
            delay,
        }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept between consecutive attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `operation` until it succeeds or the budget is spent.
    ///
    /// The closure receives the zero-based attempt index so callers can
    /// rotate mirrors between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] carrying the final attempt's error.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let made = attempt.saturating_add(1);
                    if made >= self.max_attempts {
                        return Err(RetryExhausted {
                            attempts: made,
                            last_error: error,
                        });
                    }
                    tracing::warn!(
                        attempt = made,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt = made;
                }
            }
        }
    }
}
