//! Domain model tracked by the orchestrator.

mod diagnosis;
mod execution;
mod status;
mod step;

pub use diagnosis::{AlertType, DiagnosticCategory, Diagnosis, Severity};
pub use execution::{
    AlertContext, BottleneckContext, DeliverableRef, DiagnosticContext, ErrorEntry,
    FailureContext, RecoveryContext, ResponseMetrics, WorkflowExecution,
};
pub use status::{ExecutionStatus, FailureReason, StepName, StepStatus, WorkflowOutcome};
pub use step::WorkflowStep;
