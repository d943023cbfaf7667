// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Presets match the three places the cache talks to a backend:
//!
//! ```
//! use cmdb_cache::RetryConfig;
//!
//! // Connecting at startup: a wrong URL should fail the service quickly
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Re-subscribing a change feed: keep trying until shutdown
//! assert_eq!(RetryConfig::daemon().max_retries, None);
//!
//! // Single KV or document store call on a read path: give up fast,
//! // the caller has a fallback
//! assert_eq!(RetryConfig::query().max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts; `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for long-running background work, capped at 1 minute
    /// between attempts.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries on a read or refresh path.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait after `delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }

    fn exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

/// Run `operation` until it succeeds or the attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if config.exhausted(attempts) {
                    return Err(err);
                }
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = ?config.max_retries,
                    retry_in = ?delay,
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Like [`retry`], but gives up as soon as `cancel` fires.
///
/// Returns `None` when cancelled, otherwise the final outcome.
pub async fn retry_until_cancelled<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Option<Result<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = retry(operation_name, config, operation) => Some(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_until_cancelled_stops_infinite_retry() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: None,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            factor: 1.0,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome: Option<Result<(), TestError>> =
            retry_until_cancelled("watch", &config, &cancel, || async {
                Err(TestError("down".into()))
            })
            .await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_retry_until_cancelled_returns_success() {
        let cancel = CancellationToken::new();
        let outcome: Option<Result<u8, TestError>> =
            retry_until_cancelled("watch", &RetryConfig::test(), &cancel, || async { Ok(7) }).await;
        assert_eq!(outcome.unwrap().unwrap(), 7);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert!(RetryConfig::daemon().max_retries.is_none());
        assert_eq!(RetryConfig::query().max_retries, Some(3));
        assert!(RetryConfig::query().max_delay < RetryConfig::daemon().max_delay);
    }

    #[test]
    fn test_delay_exponential_backoff_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            factor: 2.0,
            max_retries: Some(5),
        };

        let mut delay = config.initial_delay;
        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(200));
        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(350));
        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(350));
    }
}
