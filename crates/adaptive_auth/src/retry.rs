//! Bounded retry with exponential backoff and jitter
//!
//! Used only for transient collaborator I/O (policy fetch, baseline fetch).
//! Security outcomes such as replay, lockout or expiry are never retried here.

use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Enable jitter to avoid thundering herd
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0_f64,
            enable_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create no-retry policy
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create fixed delay retry policy
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0_f64,
            enable_jitter: false,
        }
    }

    /// Check if error should trigger another attempt
    #[must_use]
    pub fn should_retry(&self, error: &AdaptiveAuthError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_transient() && !error.is_security_event()
    }

    /// Calculate delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.max(1.0_f64).powi(exponent);
        let nanos = self.initial_delay.as_nanos() as f64 * multiplier;
        let base_delay = if nanos.is_finite() && nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_delay
        };

        let delay = base_delay.min(self.max_delay);

        if self.enable_jitter {
            Self::add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_factor = rng.gen_range(0.5_f64..1.5_f64);
        Duration::from_nanos((delay.as_nanos() as f64 * jitter_factor) as u64)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    ///
    /// # Errors
    ///
    /// Returns the last error when the operation never succeeds
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> AdaptiveAuthResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdaptiveAuthResult<T>>,
    {
        let mut attempt = 1_u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(&error, attempt) => {
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        "{} attempt {} failed ({}), retrying in {:?}",
                        operation_name, attempt, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
