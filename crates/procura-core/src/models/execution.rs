//! Execution record for one triggered workflow run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::diagnosis::{AlertType, Diagnosis};
use super::status::{ExecutionStatus, FailureReason, StepName, WorkflowOutcome};
use super::step::WorkflowStep;
use crate::error::TransitionError;

/// One entry of the bounded per-execution error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: StepName,
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Where and why an execution failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub reason: Option<FailureReason>,
    pub step: Option<StepName>,
    /// Most recent errors, oldest first.
    #[serde(default)]
    pub error_history: Vec<ErrorEntry>,
    #[serde(default)]
    pub failure_count: u32,
}

/// Step that exceeded its duration threshold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BottleneckContext {
    pub detected: bool,
    pub step: Option<StepName>,
    pub duration_ms: Option<u64>,
    pub overage_ms: Option<u64>,
    pub detected_at: Option<DateTime<Utc>>,
}

/// Automated recovery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub attempted: bool,
    #[serde(default)]
    pub actions: Vec<String>,
    pub succeeded: Option<bool>,
    pub attempted_at: Option<DateTime<Utc>>,
}

/// Diagnostics attached by the telemetry engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    pub diagnosis: Option<Diagnosis>,
    #[serde(default)]
    pub suggested_remediations: Vec<String>,
}

/// Per-execution alert guard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertContext {
    pub raised: bool,
    pub alert_type: Option<AlertType>,
    pub raised_at: Option<DateTime<Utc>>,
}

/// Latest response counts seen while waiting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub contacted: u32,
    pub responded: u32,
    pub response_rate: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Generated artifact reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableRef {
    pub artifact_id: String,
    pub artifact_url: String,
}

/// Record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub trigger_id: Option<String>,
    pub business_record_id: Option<String>,
    pub status: ExecutionStatus,
    pub outcome: Option<WorkflowOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated duration per phase in milliseconds.
    #[serde(default)]
    pub phase_durations_ms: BTreeMap<StepName, u64>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub failure: FailureContext,
    #[serde(default)]
    pub bottleneck: BottleneckContext,
    #[serde(default)]
    pub recovery: RecoveryContext,
    #[serde(default)]
    pub diagnostics: DiagnosticContext,
    #[serde(default)]
    pub alert: AlertContext,
    #[serde(default)]
    pub responses: ResponseMetrics,
    pub deliverable: Option<DeliverableRef>,
    pub approval_task_id: Option<String>,
    pub follow_up_id: Option<String>,
    /// Downstream acceptance of the delivered deliverable, once known.
    pub deliverable_accepted: Option<bool>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Creates a fresh execution in `initializing`.
    pub fn new(id: impl Into<String>, trigger_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            trigger_id,
            business_record_id: None,
            status: ExecutionStatus::Initializing,
            outcome: None,
            started_at: now,
            completed_at: None,
            phase_durations_ms: BTreeMap::new(),
            steps: Vec::new(),
            failure: FailureContext::default(),
            bottleneck: BottleneckContext::default(),
            recovery: RecoveryContext::default(),
            diagnostics: DiagnosticContext::default(),
            alert: AlertContext::default(),
            responses: ResponseMetrics::default(),
            deliverable: None,
            approval_task_id: None,
            follow_up_id: None,
            deliverable_accepted: None,
            metadata: Map::new(),
            updated_at: now,
        }
    }

    /// Moves the execution to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, to: ExecutionStatus) -> Result<ExecutionStatus, TransitionError> {
        let from = self.status;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        self.status = to;
        Ok(from)
    }

    /// Whether the execution reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The step currently in progress, if any.
    pub fn in_progress_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.is_in_progress())
    }

    /// Most recent attempt of a phase.
    pub fn latest_step(&self, name: StepName) -> Option<&WorkflowStep> {
        self.steps.iter().rev().find(|step| step.name == name)
    }

    /// Number of attempts recorded for a phase.
    pub fn attempts(&self, name: StepName) -> u32 {
        self.steps.iter().filter(|step| step.name == name).count() as u32
    }

    /// Pushes an error onto the bounded history, dropping the oldest entries.
    pub fn push_error(&mut self, entry: ErrorEntry, bound: usize) {
        self.failure.error_history.push(entry);
        let len = self.failure.error_history.len();
        if len > bound {
            self.failure.error_history.drain(..len - bound);
        }
    }

    /// Adds a finished step's duration to the phase total.
    pub fn add_phase_duration(&mut self, name: StepName, duration: std::time::Duration) {
        *self.phase_durations_ms.entry(name).or_insert(0) += duration.as_millis() as u64;
    }

    /// Response rate seen across the latest counts.
    pub fn response_rate(&self) -> Option<f64> {
        (self.responses.contacted > 0).then_some(self.responses.response_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> ErrorEntry {
        ErrorEntry {
            step: StepName::Contact,
            reason: FailureReason::StepError,
            message: format!("error {n}"),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_new_execution_is_initializing() {
        let exec = WorkflowExecution::new("wf-1", Some("trigger-1".to_string()), Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Initializing);
        assert!(exec.steps.is_empty());
        assert!(!exec.is_terminal());
    }

    #[test]
    fn test_transition_rejects_after_completed() {
        let mut exec = WorkflowExecution::new("wf-1", None, Utc::now());
        exec.transition_to(ExecutionStatus::Detecting).unwrap();
        exec.transition_to(ExecutionStatus::Completed).unwrap();
        let err = exec.transition_to(ExecutionStatus::Contacted).unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Completed);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut exec = WorkflowExecution::new("wf-1", None, Utc::now());
        for n in 0..15 {
            exec.push_error(entry(n), 10);
        }
        assert_eq!(exec.failure.error_history.len(), 10);
        assert_eq!(exec.failure.error_history[0].message, "error 5");
    }

    #[test]
    fn test_phase_durations_accumulate() {
        let mut exec = WorkflowExecution::new("wf-1", None, Utc::now());
        exec.add_phase_duration(StepName::Send, std::time::Duration::from_secs(2));
        exec.add_phase_duration(StepName::Send, std::time::Duration::from_secs(3));
        assert_eq!(exec.phase_durations_ms[&StepName::Send], 5000);
    }

    #[test]
    fn test_execution_serializes_status_snake_case() {
        let exec = WorkflowExecution::new("wf-1", None, Utc::now());
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["status"], "initializing");
        let back: WorkflowExecution = serde_json::from_value(json).unwrap();
        assert_eq!(back, exec);
    }
}
