//! Activity retry policy with exponential backoff
//!
//! - Delay before retry `n` (1-based): `initial_interval * coefficient^(n-1)`,
//!   capped at `maximum_interval`
//! - Down-jitter: the delay is multiplied by a factor in `[1 - jitter, 1.0]`
//! - `NonRetryable` errors end the loop immediately
//! - An attempt exceeding `start_to_close` counts as a retryable failure

use crate::error::ActivityError;
use std::future::Future;
use std::time::Duration;

/// Retry configuration for one activity
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Growth factor between consecutive delays
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay
    pub maximum_interval: Duration,
    /// Total attempts, including the first (0 means unlimited)
    pub maximum_attempts: u32,
    /// Down-jitter fraction in `[0, 1]`
    pub jitter: f64,
    /// Per-attempt timeout
    pub start_to_close: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 5,
            jitter: 0.25,
            start_to_close: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting; for tests and local simulation
    #[must_use]
    pub fn immediate(maximum_attempts: u32) -> Self {
        Self {
            initial_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            maximum_interval: Duration::ZERO,
            maximum_attempts,
            jitter: 0.0,
            start_to_close: None,
        }
    }

    /// Single attempt, no retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = Some(timeout);
        self
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.maximum_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Backoff before retry number `retry`, with down-jitter applied
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - rand::random::<f64>() * jitter;
        self.backoff(retry).mul_f64(factor)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts != 0 && attempt >= self.maximum_attempts
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// # Errors
    /// The last error once no further attempt is allowed.
    pub async fn execute<T, F, Fut>(&self, activity: &str, mut op: F) -> Result<T, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = match self.start_to_close {
                Some(limit) => tokio::time::timeout(limit, op()).await.unwrap_or_else(|_| {
                    Err(ActivityError::Retryable(format!(
                        "attempt exceeded start-to-close timeout of {limit:?}"
                    )))
                }),
                None => op().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err @ ActivityError::NonRetryable(_)) => {
                    tracing::error!("Activity {} failed permanently: {}", activity, err);
                    return Err(err);
                }
                Err(err) if self.exhausted(attempt) => {
                    tracing::error!(
                        "Activity {} failed after {} attempt(s): {}",
                        activity,
                        attempt,
                        err
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "Activity {} attempt {} failed: {}; retrying in {:?}",
                        activity,
                        attempt,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
