//! Workflow orchestration engine for Procura.
//!
//! Drives a quote-style request from trigger detection through third-party
//! contact, response collection, deliverable generation, human approval and
//! delivery, with retries, circuit breakers, telemetry and automated
//! recovery around every external call.

pub mod error;
pub mod escalation;
pub mod monitor;
pub mod orchestrator;
pub mod resilience;
pub mod step_executor;
pub mod telemetry;

pub use error::{OrchestratorError, Result};
pub use escalation::Escalator;
pub use monitor::{CollectionReason, CollectionResult, ResponseMonitor};
pub use orchestrator::{ApprovalDecision, ApprovalResult, Collaborators, StartResult, WorkflowOrchestrator};
pub use resilience::{
    BreakerRegistry, CircuitBreakerState, CircuitState, InMemoryBreakerRegistry, RetryMetrics, RetryPolicy,
    RetrySignal, guarded_call,
};
pub use step_executor::{PhaseFailure, StepExecutor};
pub use telemetry::{
    Alert, AlertReport, BottleneckReport, FailureClassifier, FailureReport, FailureSignal, HealthMetrics,
    HealthSummary, Predicate, RecoveryPlan, StepFailure, Telemetry, TrendSnapshot,
};
