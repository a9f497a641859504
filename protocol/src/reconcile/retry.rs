//! Capped exponential backoff for transient failures.
//!
//! The delay schedule comes from [`exponential_backoff::Backoff`]: doubling
//! from `base_delay`, jittered, never above `max_delay`. Its iterator yields
//! one delay per retry and `None` on the last attempt.

use exponential_backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

/// The outcome of a retried operation that never succeeded.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// The schedule for one `run`. Zero attempts is treated as one.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.max_attempts.max(1), self.base_delay, self.max_delay)
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` says
    /// not to retry, or attempts run out.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let backoff = self.backoff();
        let mut delays = (&backoff).into_iter();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_transient(&err) {
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
            match delays.next() {
                Some(Some(delay)) => {
                    debug!(op = label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: err,
                    })
                }
            }
        }
    }
}
