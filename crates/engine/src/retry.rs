//! Bounded retries with fixed or exponential backoff.
//!
//! [`RetryPolicy::run`] keeps calling an operation until it succeeds, fails
//! with a non-transient error, runs out of attempts, or the
//! [`CancellationToken`] fires. Backoff sleeps are cancellable.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound on the delay between attempts.
        max: Duration,
        /// Factor by which the delay grows after each failure.
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay to wait before the next attempt, given the one just waited.
    ///
    /// Exponential growth is clamped to `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential {
                max, multiplier, ..
            } => {
                let next_ms = (current.as_millis() as f64 * multiplier) as u64;
                Duration::from_millis(next_ms).min(max)
            }
        }
    }

    fn first_delay(&self) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max, .. } => initial.min(max),
        }
    }
}

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Result of a retried operation together with the retries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, ExecutionError>,
    pub retry_count: u32,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` under this policy. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Retried<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let mut delay = self.backoff.first_delay();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let retry_count = attempt - 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
                result = op(attempt) => result,
            };

            match outcome {
                Ok(value) => {
                    if retry_count > 0 {
                        tracing::info!(operation, attempt, "Succeeded after retry");
                    }
                    return Retried {
                        result: Ok(value),
                        retry_count,
                    };
                }
                Err(e) if !e.is_transient() => {
                    return Retried {
                        result: Err(e),
                        retry_count,
                    };
                }
                Err(e) if attempt >= self.total_attempts() => {
                    tracing::warn!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Giving up after transient failures",
                    );
                    return Retried {
                        result: Err(e),
                        retry_count,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying",
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Retried {
                        result: Err(ExecutionError::Cancelled),
                        retry_count: attempt - 1,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = self.backoff.next_delay(delay);
        }
    }
}
