//! Failure isolation for calls to external dependencies.

mod circuit_breaker;
mod retry;

use std::future::Future;

use procura_core::ServiceResult;
use tracing::warn;

pub use circuit_breaker::{BreakerRegistry, CircuitBreakerState, CircuitState, InMemoryBreakerRegistry};
pub use retry::{RetryMetrics, RetryPolicy, RetrySignal};

use crate::error::{OrchestratorError, Result};

/// Calls a dependency through its circuit breaker and the retry policy.
///
/// An open breaker fails fast without calling. Otherwise the retry policy
/// runs the operation and the breaker records one outcome for the whole
/// call, not one per attempt.
pub async fn guarded_call<T, F, Fut>(
    breakers: &dyn BreakerRegistry,
    retry: &RetryPolicy,
    dependency: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    if !breakers.check(dependency).await {
        return Err(OrchestratorError::CircuitOpen { dependency: dependency.to_string() });
    }

    match retry
        .execute_with(operation, |err, metrics| {
            warn!(
                dependency = %dependency,
                attempt = metrics.attempt,
                max_retries = metrics.max_retries,
                delay_ms = metrics.delay.as_millis() as u64,
                error = %err,
                "Dependency call failed, retrying"
            );
        })
        .await
    {
        Ok(value) => {
            breakers.record_success(dependency).await;
            Ok(value)
        }
        Err(source) => {
            breakers.record_failure(dependency).await;
            Err(OrchestratorError::Service { dependency: dependency.to_string(), source })
        }
    }
}
