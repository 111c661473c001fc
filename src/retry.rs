//! Retry utilities with exponential backoff and jitter.
//!
//! [`RetryConfig`] describes one backoff curve. It is used two ways:
//! - [`retry_with_backoff`] retries an async operation in-line (startup calls)
//! - [`BackoffTracker`] counts consecutive failures per reconcile key so the
//!   controller's error policy can requeue with a growing delay instead of
//!   blocking a worker

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped at `max_delay`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay before retry number `attempt`: 0.5x to 1.5x of the base,
    /// never above `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.base_delay(attempt).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted in which case
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Per-key consecutive failure counter driving reconcile backoff.
///
/// A key's count grows with every failed pass and is reset by the first
/// successful one. Once the count reaches `budget` the key is considered
/// exhausted and the reconciler records a terminal failure.
#[derive(Debug)]
pub struct BackoffTracker {
    config: RetryConfig,
    budget: u32,
    failures: DashMap<String, u32>,
}

impl BackoffTracker {
    /// Create a tracker with the given curve and retry budget (0 = unlimited)
    pub fn new(config: RetryConfig, budget: u32) -> Self {
        Self {
            config,
            budget,
            failures: DashMap::new(),
        }
    }

    /// Record a failed pass and return the delay before the next attempt
    pub fn record_failure(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        self.config.delay_for_attempt(*entry)
    }

    /// Jittered delay matching the failures already recorded for `key`
    pub fn delay_for(&self, key: &str) -> Duration {
        self.config.delay_for_attempt(self.failures(key).max(1))
    }

    /// Number of consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }

    /// True once `key` has used up its retry budget
    pub fn is_exhausted(&self, key: &str) -> bool {
        self.budget > 0 && self.failures(key) >= self.budget
    }

    /// Forget all failures for `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }
}
