//! Error types for workflow orchestration.

use procura_core::{ExecutionStatus, FailureReason, ServiceError, StepName, StorageError, TransitionError};
use thiserror::Error;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestration errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The dependency's circuit breaker is open; the call was not attempted.
    #[error("circuit breaker open for dependency '{dependency}'")]
    CircuitOpen {
        /// Breaker name.
        dependency: String,
    },

    /// A collaborator call failed after retries.
    #[error("{dependency} call failed: {source}")]
    Service {
        /// Dependency the call was made against.
        dependency: String,
        /// Last error returned by the collaborator.
        #[source]
        source: ServiceError,
    },

    /// The contact phase reached nobody.
    #[error("no eligible recipients for business record")]
    NoEligibleRecipients,

    /// The response window closed without a single reply.
    #[error("no responses received within the response window")]
    NoResponses,

    /// Detection matched but produced no business record.
    #[error("detection matched without a business record id")]
    MissingBusinessRecord,

    /// Delivery was requested before a deliverable was generated.
    #[error("no deliverable generated for this workflow")]
    MissingDeliverable,

    /// Status change forbidden by the state machine.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Another step is still running for the execution.
    #[error("cannot start step {requested} while {active} is in progress")]
    StepConflict {
        /// Step currently in progress.
        active: StepName,
        /// Step that was asked to start.
        requested: StepName,
    },

    /// Step finished that was never started.
    #[error("step {0} is not in progress")]
    StepNotStarted(StepName),

    /// No execution record with this id.
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// The workflow belongs to a different business record.
    #[error("workflow {workflow_id} does not belong to business record {business_record_id}")]
    ApprovalMismatch {
        /// Workflow id supplied by the caller.
        workflow_id: String,
        /// Business record id supplied by the caller.
        business_record_id: String,
    },

    /// Approval was resolved for a workflow not waiting on one.
    #[error("workflow {workflow_id} is not awaiting approval (status {status})")]
    NotAwaitingApproval {
        /// Workflow id.
        workflow_id: String,
        /// Current status.
        status: ExecutionStatus,
    },

    /// Execution store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl OrchestratorError {
    /// Wraps a collaborator error with its dependency name.
    pub fn service(dependency: impl Into<String>) -> impl FnOnce(ServiceError) -> Self {
        let dependency = dependency.into();
        move |source| Self::Service { dependency, source }
    }

    /// Failure reason code recorded on the execution.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::CircuitOpen { .. } => FailureReason::CircuitOpen,
            Self::NoEligibleRecipients => FailureReason::NoEligibleRecipients,
            Self::NoResponses => FailureReason::NoResponsesReceived,
            Self::MissingBusinessRecord => FailureReason::DetectionFailed,
            Self::Service { dependency, source } => {
                if is_timeout(source) {
                    return FailureReason::Timeout;
                }
                match dependency.as_str() {
                    "detection" => FailureReason::DetectionFailed,
                    "deliverable-generation" => FailureReason::GenerationFailed,
                    "delivery-send" => FailureReason::DeliveryFailed,
                    _ => FailureReason::StepError,
                }
            }
            _ => FailureReason::StepError,
        }
    }

    /// Errors caused by the caller's request rather than by the workflow.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::ExecutionNotFound(_) | Self::ApprovalMismatch { .. } | Self::NotAwaitingApproval { .. }
        )
    }
}

fn is_timeout(err: &ServiceError) -> bool {
    err.code.as_deref() == Some("ETIMEDOUT") || err.message.to_lowercase().contains("timeout")
}
