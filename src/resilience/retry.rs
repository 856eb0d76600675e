// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Wraps a single async operation with a bounded number of attempts. Each
//! invocation is independent; nothing is remembered between calls.
//!
//! # Example
//!
//! ```
//! use door_bridge::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: authenticate collaborators, fail after a handful of tries
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // Query: quick retry around a single unlock or send
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, 3);
//!
//! // Base delay for the n-th attempt (jitter applied on top)
//! assert_eq!(query.base_delay(1), Duration::from_millis(100));
//! assert_eq!(query.base_delay(2), Duration::from_millis(200));
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Authentication and other startup calls
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one (always >= 1)
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the base delay added or removed at random (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Retry for collaborator authentication during start.
    /// 5 attempts with exponential backoff, giving up after a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Quick retry for individual calls (unlock, event send).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Fast retry for tests (minimal delays, no jitter)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// `min(initial_delay * factor^(attempt-1), max_delay)` for a 1-based attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Base delay with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        base.mul_f64(factor.max(0.0))
    }
}

/// Retry `operation` on every error until `max_attempts` is exhausted.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(operation_name, config, operation, |_| true, |_, _, _| {}).await
}

/// Retry `operation` while `should_retry` approves the error.
///
/// `on_retry` is invoked before each wait with `(attempt, &error, delay)`.
/// The last error is returned unchanged once attempts run out or the
/// predicate declines.
pub async fn retry_with<F, Fut, T, E, P, C>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
    mut on_retry: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    C: FnMut(usize, &E, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempt - 1);
                }
                return Ok(val);
            }
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }

                let delay = config.jittered_delay(attempt);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempt, max_attempts, err, delay
                );
                crate::metrics::record_retry(operation_name);
                on_retry(attempt, &err, delay);

                sleep(delay).await;
            }
        }
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
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts_and_returns_original_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let config = RetryConfig { max_attempts: 4, ..RetryConfig::test() };

        let result: Result<i32, TestError> = retry(
            "test_op",
            &config,
            || {
                let a = attempts_clone.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(TestError(format!("always fail #{}", n)))
                }
            },
        ).await;

        assert_eq!(result.unwrap_err().0, "always fail #4");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_predicate_stops_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry_with(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("fatal".into()))
                }
            },
            |e: &TestError| e.0 != "fatal",
            |_, _, _| {},
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_retry_sees_each_wait() {
        let mut seen = Vec::new();

        let _: Result<i32, TestError> = retry_with(
            "test_op",
            &RetryConfig::test(),
            || async { Err(TestError("nope".into())) },
            |_| true,
            |attempt, err: &TestError, delay| seen.push((attempt, err.0.clone(), delay)),
        ).await;

        // 3 attempts -> 2 waits
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[0].2, Duration::from_millis(1));
        assert_eq!(seen[1].2, Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let attempts = AtomicUsize::new(0);
        let config = RetryConfig { max_attempts: 0, ..RetryConfig::test() };

        let _: Result<(), TestError> = retry("test_op", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError("x".into())) }
        }).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_attempts, 5);
        assert_eq!(RetryConfig::query().max_attempts, 3);
        assert_eq!(RetryConfig::default(), RetryConfig::query());
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_attempts: 5,
            jitter: 0.0,
        };

        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: 5,
            jitter: 0.0,
        };

        assert_eq!(config.base_delay(2), Duration::from_secs(5));
        assert_eq!(config.base_delay(60), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_attempts: 5,
            jitter: 0.25,
        };

        for _ in 0..200 {
            let d = config.jittered_delay(1);
            assert!(d >= Duration::from_millis(750), "{:?}", d);
            assert!(d <= Duration::from_millis(1250), "{:?}", d);
        }
    }
}
