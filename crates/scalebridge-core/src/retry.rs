//! Exponential backoff for connection operations.
//!
//! `calculate_delay(n) = min(max_delay, base_delay * multiplier^(n - 1))`
//! with 1-indexed attempts. The periodic reconnect scan uses its own fixed
//! interval and does not go through this module.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Keywords that mark an error message as transient.
pub const RETRYABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "busy",
    "temporary",
    "unavailable",
    "try again",
];

/// Retry/backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay before retry number `attempt` (1-indexed; 0 is treated as 1).
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.max(1) - 1;
    let delay = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent as i32);
    let capped = delay.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Default predicate: does the error text mention a transient failure?
pub fn is_retryable(error: &impl Display) -> bool {
    let message = error.to_string().to_lowercase();
    RETRYABLE_KEYWORDS
        .iter()
        .any(|keyword| message.contains(keyword))
}

/// Run `operation`, retrying every failure until attempts run out.
///
/// `on_retry(attempt, &error, delay)` runs before each wait. After the last
/// attempt the final error is returned unchanged.
///
/// # Errors
///
/// Returns the last error from `operation`.
pub async fn with_retry<T, E, F, Fut, R>(operation: F, on_retry: R, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, &E, Duration),
{
    with_conditional_retry(operation, |_| true, on_retry, config).await
}

/// Like [`with_retry`], but stops at the first error `should_retry` rejects.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts
/// are exhausted.
pub async fn with_conditional_retry<T, E, F, Fut, P, R>(
    mut operation: F,
    should_retry: P,
    mut on_retry: R,
    config: &RetryConfig,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    R: FnMut(u32, &E, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= max_attempts || !should_retry(&error) => return Err(error),
            Err(error) => {
                let delay = calculate_delay(attempt, config);
                on_retry(attempt, &error, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_sequence() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| calculate_delay(n, &config).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn test_attempt_zero_is_first_attempt() {
        let config = RetryConfig::default();
        assert_eq!(calculate_delay(0, &config), calculate_delay(1, &config));
    }

    #[test]
    fn test_retryable_keywords() {
        assert!(is_retryable(&"Connection reset by peer"));
        assert!(is_retryable(&"operation TIMEOUT"));
        assert!(is_retryable(&"device busy, try again"));
        assert!(!is_retryable(&"permission denied"));
        assert!(!is_retryable(&"device not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut retries = Vec::new();

        let result: Result<u32, String> = with_retry(
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("timeout {n}"))
                } else {
                    Ok(n)
                }
            },
            |attempt, _err: &String, delay| retries.push((attempt, delay)),
            &RetryConfig::default(),
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_millis(1000)),
                (2, Duration::from_millis(2000))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = with_retry(
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            },
            |_, _, _| {},
            &RetryConfig::default(),
        )
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut callbacks = 0;
        let result: Result<(), String> = with_conditional_retry(
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("invalid input".to_string())
            },
            |err: &String| is_retryable(err),
            |_, _, _| callbacks += 1,
            &RetryConfig::default(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks, 0);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RetryConfig = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 1_000);
    }
}
