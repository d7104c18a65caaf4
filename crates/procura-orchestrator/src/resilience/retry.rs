//! Bounded retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use procura_core::clock::elapsed_between;
use procura_core::{Clock, RetryPolicyConfig, ServiceError};
use rand::Rng;
use tracing::warn;

use crate::error::OrchestratorError;

/// Substrings that mark an error as transient regardless of configuration.
const GENERIC_TRANSIENT: [&str; 3] = ["timeout", "network", "connect"];

/// Error shape inspected by the retry policy.
pub trait RetrySignal: fmt::Display {
    /// Machine-readable code, when the error carries one.
    fn code(&self) -> Option<&str>;
}

impl RetrySignal for ServiceError {
    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl RetrySignal for OrchestratorError {
    fn code(&self) -> Option<&str> {
        match self {
            Self::Service { source, .. } => source.code.as_deref(),
            _ => None,
        }
    }
}

/// Passed to the retry observer before each wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMetrics {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_retries: u32,
    /// Wait before the next attempt, jitter applied.
    pub delay: Duration,
    /// Time since the first attempt started.
    pub elapsed: Duration,
}

/// Retry executor. Stateless apart from the waits it takes on its clock.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Pre-jitter delay before retry number `retry_index + 1`.
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let scaled = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay with symmetric jitter applied, floored at zero and rounded to
    /// whole milliseconds.
    pub fn jittered_delay(&self, retry_index: u32) -> Duration {
        let base = self.base_delay(retry_index).as_millis() as f64;
        let spread = base * self.config.jitter_fraction;
        let offset = if spread > 0.0 { rand::thread_rng().gen_range(-spread..=spread) } else { 0.0 };
        Duration::from_millis((base + offset).max(0.0).round() as u64)
    }

    /// Whether an error may be retried.
    pub fn is_retryable<E: RetrySignal + ?Sized>(&self, err: &E) -> bool {
        let signatures = &self.config.retryable_errors;
        if signatures.is_empty() {
            return true;
        }
        if let Some(code) = err.code() {
            if signatures.iter().any(|signature| signature == code) {
                return true;
            }
        }
        let message = err.to_string().to_lowercase();
        signatures.iter().any(|signature| message.contains(&signature.to_lowercase()))
            || GENERIC_TRANSIENT.iter().any(|generic| message.contains(generic))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts `max_retries + 1` attempts.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetrySignal,
    {
        self.execute_with(operation, |err: &E, metrics: &RetryMetrics| {
            warn!(
                attempt = metrics.attempt,
                max_retries = metrics.max_retries,
                delay_ms = metrics.delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
        })
        .await
    }

    /// Like [`execute`](Self::execute), calling `on_retry` before each wait.
    pub async fn execute_with<T, E, F, Fut, O>(&self, mut operation: F, mut on_retry: O) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetrySignal,
        O: FnMut(&E, &RetryMetrics),
    {
        let started = self.clock.now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt > self.config.max_retries || !self.is_retryable(&err) {
                return Err(err);
            }
            let delay = self.jittered_delay(attempt - 1);
            let metrics = RetryMetrics {
                attempt,
                max_retries: self.config.max_retries,
                delay,
                elapsed: elapsed_between(started, self.clock.now()),
            };
            on_retry(&err, &metrics);
            self.clock.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_core::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(config: RetryPolicyConfig) -> RetryPolicy {
        RetryPolicy::new(config, Arc::new(ManualClock::starting_now()))
    }

    fn no_jitter() -> RetryPolicyConfig {
        RetryPolicyConfig { jitter_fraction: 0.0, ..RetryPolicyConfig::default() }
    }

    #[test]
    fn test_fourth_attempt_waits_four_seconds() {
        let policy = policy(no_jitter());
        assert_eq!(policy.base_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = policy(no_jitter());
        assert_eq!(policy.base_delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = policy(RetryPolicyConfig::default());
        for _ in 0..100 {
            let delay = policy.jittered_delay(1).as_millis();
            assert!((1800..=2200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_retryability_rules() {
        let policy = policy(RetryPolicyConfig::default());
        assert!(policy.is_retryable(&ServiceError::with_code("ECONNRESET", "reset")));
        assert!(policy.is_retryable(&ServiceError::new("upstream rate limit hit")));
        assert!(policy.is_retryable(&ServiceError::new("request timeout")));
        assert!(policy.is_retryable(&ServiceError::new("could not connect")));
        assert!(!policy.is_retryable(&ServiceError::new("invalid record")));

        let permissive = RetryPolicy::new(
            RetryPolicyConfig { retryable_errors: Vec::new(), ..RetryPolicyConfig::default() },
            Arc::new(ManualClock::starting_now()),
        );
        assert!(permissive.is_retryable(&ServiceError::new("invalid record")));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = policy(no_jitter());
        let calls = AtomicU32::new(0);
        let mut observed = Vec::new();

        let result = policy
            .execute_with(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 { Err(ServiceError::network("flaky")) } else { Ok(n) }
                    }
                },
                |_: &ServiceError, metrics: &RetryMetrics| observed.push(metrics.delay),
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(observed, vec![Duration::from_millis(1000), Duration::from_millis(2000)]);
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_after_first_attempt() {
        let policy = policy(no_jitter());
        let calls = AtomicU32::new(0);

        let result: Result<(), ServiceError> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::new("validation failed")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = policy(no_jitter());
        let calls = AtomicU32::new(0);

        let result: Result<(), ServiceError> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ServiceError::timeout(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(result.unwrap_err().message.contains("attempt 3"));
    }
}
