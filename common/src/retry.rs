// Retry strategy for transport-level connect attempts
// Authentication failures are never retried, see DeployError::is_retryable

use crate::errors::DeployError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None if max retries exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;
}

/// Fixed delay retry strategy
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 0)
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            None
        } else {
            Some(self.delay)
        }
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// strategy gives up
pub async fn retry_transient<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    mut operation: F,
) -> Result<T, DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeployError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && strategy.should_retry(attempt) => {
                let delay = strategy.next_delay(attempt).unwrap_or(Duration::ZERO);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
