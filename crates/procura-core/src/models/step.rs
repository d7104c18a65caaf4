//! A single attempt at one workflow phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::{StepName, StepStatus};

/// Record of one phase attempt within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Phase this attempt belongs to.
    pub name: StepName,
    /// Current status.
    pub status: StepStatus,
    /// When the attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt completed, failed or was skipped.
    pub ended_at: Option<DateTime<Utc>>,
    /// Error message if the attempt failed.
    pub error: Option<String>,
    /// Phase-specific result data (e.g. number of recipients contacted).
    #[serde(default)]
    pub metadata: Value,
    /// 1-based attempt number for this phase within the execution.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl WorkflowStep {
    /// Creates a pending step.
    pub fn new(name: StepName, attempt: u32) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            metadata: Value::Null,
            attempt,
        }
    }

    /// Marks the step as started.
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(at);
        self.ended_at = None;
        self.error = None;
    }

    /// Marks the step as completed with its result metadata.
    pub fn mark_completed(&mut self, at: DateTime<Utc>, metadata: Value) {
        self.status = StepStatus::Completed;
        self.ended_at = Some(self.clamp_end(at));
        self.metadata = metadata;
        self.error = None;
    }

    /// Marks the step as failed with an error message.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.ended_at = Some(self.clamp_end(at));
        self.error = Some(error.into());
    }

    /// Marks the step as skipped.
    pub fn mark_skipped(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::Skipped;
        self.ended_at = Some(self.clamp_end(at));
    }

    /// Checks if the step is in progress.
    pub fn is_in_progress(&self) -> bool {
        self.status == StepStatus::InProgress
    }

    /// Wall-clock duration of a finished step.
    pub fn duration(&self) -> Option<std::time::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(crate::clock::elapsed_between(start, end)),
            _ => None,
        }
    }

    // The end timestamp never precedes the start.
    fn clamp_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self.started_at {
            Some(start) if at < start => start,
            _ => at,
        }
    }
}
