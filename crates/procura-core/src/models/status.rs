//! Status vocabularies for executions and steps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record created, nothing run yet.
    Initializing,
    /// Classifying the trigger.
    Detecting,
    /// Notifying third parties.
    Contacted,
    /// Waiting for third-party replies.
    AwaitingResponses,
    /// Building the deliverable.
    GeneratingDeliverable,
    /// Waiting on a human approval decision.
    PendingApproval,
    /// Deliverable handed to the delivery service.
    Sent,
    /// Finished; no further step may run.
    Completed,
    /// Unrecoverable failure; no further step may run.
    Failed,
    /// Non-terminal for too long and handed to a human.
    Stuck,
    /// An automated recovery attempt is in flight.
    Recovering,
}

impl ExecutionStatus {
    /// All statuses, in phase order followed by the side branches.
    pub const ALL: [Self; 11] = [
        Self::Initializing,
        Self::Detecting,
        Self::Contacted,
        Self::AwaitingResponses,
        Self::GeneratingDeliverable,
        Self::PendingApproval,
        Self::Sent,
        Self::Completed,
        Self::Failed,
        Self::Stuck,
        Self::Recovering,
    ];

    /// Statuses the stuck-workflow sweep looks at.
    pub const ACTIVE: [Self; 7] = [
        Self::Initializing,
        Self::Detecting,
        Self::Contacted,
        Self::AwaitingResponses,
        Self::GeneratingDeliverable,
        Self::Sent,
        Self::Recovering,
    ];

    /// String form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Detecting => "detecting",
            Self::Contacted => "contacted",
            Self::AwaitingResponses => "awaiting_responses",
            Self::GeneratingDeliverable => "generating_deliverable",
            Self::PendingApproval => "pending_approval",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
            Self::Recovering => "recovering",
        }
    }

    /// `completed` and `failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the forward phase sequence, `None` for side branches.
    fn phase_rank(self) -> Option<u8> {
        match self {
            Self::Initializing => Some(0),
            Self::Detecting => Some(1),
            Self::Contacted => Some(2),
            Self::AwaitingResponses => Some(3),
            Self::GeneratingDeliverable => Some(4),
            Self::PendingApproval => Some(5),
            Self::Sent => Some(6),
            Self::Completed => Some(7),
            Self::Failed | Self::Stuck | Self::Recovering => None,
        }
    }

    /// Checks whether the execution can move to `to`.
    ///
    /// Forward moves along the phase sequence are allowed, as are the
    /// `failed`, `stuck` and `recovering` branches from any non-terminal
    /// status. `stuck` and `recovering` may resume into any phase.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.phase_rank(), to.phase_rank()) {
            // Branching off the main sequence
            (_, None) => true,
            // Resuming from stuck/recovering into any phase but the very first
            (None, Some(rank)) => rank > 0,
            // Same or later phase
            (Some(from), Some(rank)) => rank >= from,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status: {s}"))
    }
}

/// Named phase of the fixed workflow sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Detection,
    Contact,
    ResponseWait,
    Generation,
    Approval,
    Send,
}

impl StepName {
    /// All steps in sequence order.
    pub const SEQUENCE: [Self; 6] = [
        Self::Detection,
        Self::Contact,
        Self::ResponseWait,
        Self::Generation,
        Self::Approval,
        Self::Send,
    ];

    /// String form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Contact => "contact",
            Self::ResponseWait => "response_wait",
            Self::Generation => "generation",
            Self::Approval => "approval",
            Self::Send => "send",
        }
    }

    /// Circuit-breaker dependency guarding this step's external call.
    pub fn dependency(&self) -> Option<&'static str> {
        match self {
            Self::Detection => Some("detection"),
            Self::Contact => Some("external-contact"),
            Self::Generation => Some("deliverable-generation"),
            Self::Send => Some("delivery-send"),
            Self::ResponseWait | Self::Approval => None,
        }
    }

    /// Execution status while this step runs.
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            Self::Detection => ExecutionStatus::Detecting,
            Self::Contact => ExecutionStatus::Contacted,
            Self::ResponseWait => ExecutionStatus::AwaitingResponses,
            Self::Generation => ExecutionStatus::GeneratingDeliverable,
            Self::Approval => ExecutionStatus::PendingApproval,
            Self::Send => ExecutionStatus::Sent,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not been started.
    Pending,
    /// Step is currently executing.
    InProgress,
    /// Step completed successfully.
    Completed,
    /// Step failed with an error.
    Failed,
    /// Step was not needed.
    Skipped,
}

impl StepStatus {
    /// Completed, failed and skipped steps carry an end timestamp.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Business-level outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Detection confidence below the manual-review gate.
    NotApplicable,
    /// Detection confidence inside the manual-review band.
    ManualReview,
    /// Deliverable waiting on a human decision.
    AwaitingApproval,
    /// Deliverable approved and delivered.
    Delivered,
    /// Deliverable rejected by the approver.
    Rejected,
    /// The engine could not make progress.
    Failed,
}

impl WorkflowOutcome {
    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotApplicable => "not applicable",
            Self::ManualReview => "requires manual review",
            Self::AwaitingApproval => "awaiting approval",
            Self::Delivered => "delivered",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Machine-readable failure reason recorded on an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoEligibleRecipients,
    NoResponsesReceived,
    CircuitOpen,
    Timeout,
    DetectionFailed,
    GenerationFailed,
    DeliveryFailed,
    StepError,
}

impl FailureReason {
    /// Reason code used for escalation records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoEligibleRecipients => "no_eligible_recipients",
            Self::NoResponsesReceived => "no_responses_received",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::DetectionFailed => "detection_failed",
            Self::GenerationFailed => "generation_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::StepError => "step_error",
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoEligibleRecipients => "no eligible recipients",
            Self::NoResponsesReceived => "no responses received",
            Self::CircuitOpen => "circuit open",
            Self::Timeout => "timeout exceeded",
            Self::DetectionFailed => "detection failed",
            Self::GenerationFailed => "deliverable generation failed",
            Self::DeliveryFailed => "delivery failed",
            Self::StepError => "unexpected step error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
