//! Retry with capped exponential backoff
//!
//! Used by the uploader for blob puts and offset commits. Jitter is
//! deterministic (derived from the attempt number) so backoff behavior is
//! reproducible in tests.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts after the initial one
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) applied around the computed delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// No retries; the first failure is final
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the given attempt (1-indexed; attempt 0 is immediate)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap attempt to prevent i32 overflow and degenerate backoff
        let capped_attempt = attempt.min(30);
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped_attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter_value = (attempt as f64 * 0.618033988749895) % 1.0;
            jitter_range * (jitter_value - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// retry budget is exhausted. Returns the last error on failure.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if error.is_retryable() && attempts <= config.max_retries {
                    let delay = config.delay_for_attempt(attempts);
                    tracing::debug!(
                        attempt = attempts,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    return Err(error);
                }
            }
        }
    }
}
