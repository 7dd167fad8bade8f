//! Exponential backoff retry for host API calls.
//!
//! Only transient errors are retried; permanent errors are returned
//! immediately. Default: 3 retries with 2s, 4s, 8s delays.

use std::future::Future;
use std::time::Duration;

use super::error::HostError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Default retry configuration for host API operations: 3 retries with
    /// 2s, 4s, 8s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
    };

    /// Disables retries entirely.
    pub const NONE: Self = Self {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// The delay doubles per attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Executes an async operation, retrying transient errors with backoff.
///
/// Permanent errors are returned immediately; after `max_retries` transient
/// failures the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T, HostError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HostError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.is_retriable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "Retrying transient host error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::error::HostErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let config = RetryConfig::DEFAULT;
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(RetryConfig::DEFAULT, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HostError::transient("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(RetryConfig::DEFAULT, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(HostError::permanent("gone")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, HostErrorKind::Permanent);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(RetryConfig::DEFAULT, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(HostError::transient("still down")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, HostErrorKind::Transient);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
