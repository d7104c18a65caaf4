//! Per-dependency circuit breakers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procura_core::clock::elapsed_between;
use procura_core::{BreakerSettings, Clock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit state for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Failing fast until the cooldown elapses.
    Open,
    /// Letting calls through to probe recovery.
    HalfOpen,
}

/// Breaker bookkeeping for one named dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state: CircuitState,
}

/// Registry of breakers keyed by dependency name.
///
/// Shared by every workflow in the process. Implementations must make each
/// check/record an atomic update for its dependency.
#[async_trait]
pub trait BreakerRegistry: Send + Sync {
    /// Whether a call may proceed. An open breaker whose cooldown has elapsed
    /// moves to half-open here and lets the call through.
    async fn check(&self, dependency: &str) -> bool;

    async fn record_success(&self, dependency: &str);

    async fn record_failure(&self, dependency: &str);

    /// Current state, `Closed` with no failures for unknown dependencies.
    async fn state(&self, dependency: &str) -> CircuitBreakerState;

    /// Snapshot of every tracked dependency.
    async fn snapshot(&self) -> Vec<(String, CircuitBreakerState)>;
}

/// Process-local breaker registry. A restart resets every breaker.
pub struct InMemoryBreakerRegistry {
    states: Mutex<HashMap<String, CircuitBreakerState>>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBreakerRegistry")
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl InMemoryBreakerRegistry {
    pub fn new(settings: &BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: settings.cooldown(),
            clock,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn with_state<R>(&self, dependency: &str, f: impl FnOnce(&mut CircuitBreakerState) -> R) -> R {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        f(states.entry(dependency.to_string()).or_default())
    }
}

#[async_trait]
impl BreakerRegistry for InMemoryBreakerRegistry {
    async fn check(&self, dependency: &str) -> bool {
        let now = self.clock.now();
        let cooldown = self.cooldown;
        self.with_state(dependency, |breaker| match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = breaker
                    .last_failure_at
                    .is_none_or(|at| elapsed_between(at, now) >= cooldown);
                if cooled {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.failure_count = 0;
                    info!(dependency = %dependency, "Circuit breaker half-open after cooldown");
                } else {
                    debug!(dependency = %dependency, "Circuit breaker open, rejecting call");
                }
                cooled
            }
        })
    }

    async fn record_success(&self, dependency: &str) {
        self.with_state(dependency, |breaker| {
            if breaker.state == CircuitState::HalfOpen {
                info!(dependency = %dependency, "Circuit breaker closed after successful probe");
            }
            breaker.state = CircuitState::Closed;
            breaker.failure_count = 0;
            breaker.last_failure_at = None;
        });
    }

    async fn record_failure(&self, dependency: &str) {
        let now = self.clock.now();
        let threshold = self.failure_threshold;
        self.with_state(dependency, |breaker| {
            breaker.failure_count += 1;
            breaker.last_failure_at = Some(now);
            if breaker.state != CircuitState::Open && breaker.failure_count >= threshold {
                breaker.state = CircuitState::Open;
                warn!(
                    dependency = %dependency,
                    failure_count = breaker.failure_count,
                    "Circuit breaker opened"
                );
            }
        });
    }

    async fn state(&self, dependency: &str) -> CircuitBreakerState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(dependency).copied().unwrap_or_default()
    }

    async fn snapshot(&self) -> Vec<(String, CircuitBreakerState)> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = states.iter().map(|(name, state)| (name.clone(), *state)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_core::ManualClock;

    fn registry() -> (InMemoryBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (InMemoryBreakerRegistry::new(&BreakerSettings::default(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let (breakers, _clock) = registry();
        for _ in 0..2 {
            breakers.record_failure("detection").await;
        }
        assert!(breakers.check("detection").await);

        breakers.record_failure("detection").await;
        assert_eq!(breakers.state("detection").await.state, CircuitState::Open);
        assert!(!breakers.check("detection").await);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_closes() {
        let (breakers, clock) = registry();
        for _ in 0..3 {
            breakers.record_failure("delivery-send").await;
        }

        clock.advance(Duration::from_secs(299));
        assert!(!breakers.check("delivery-send").await);

        clock.advance(Duration::from_secs(1));
        assert!(breakers.check("delivery-send").await);
        let state = breakers.state("delivery-send").await;
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.failure_count, 0);

        breakers.record_success("delivery-send").await;
        let state = breakers.state("delivery-send").await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.last_failure_at.is_none());
    }

    #[tokio::test]
    async fn test_half_open_failures_reopen() {
        let (breakers, clock) = registry();
        for _ in 0..3 {
            breakers.record_failure("external-contact").await;
        }
        clock.advance(Duration::from_secs(300));
        assert!(breakers.check("external-contact").await);

        for _ in 0..3 {
            breakers.record_failure("external-contact").await;
        }
        assert_eq!(breakers.state("external-contact").await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_dependencies_are_independent() {
        let (breakers, _clock) = registry();
        for _ in 0..3 {
            breakers.record_failure("detection").await;
        }
        assert!(!breakers.check("detection").await);
        assert!(breakers.check("deliverable-generation").await);
    }
}
