//! Workflow telemetry and diagnostics.
//!
//! Records step progress and durations on the execution, flags bottlenecks
//! against per-phase thresholds, classifies failures, tracks recovery, and
//! raises stuck and trend alerts.
//!
//! Every recording operation comes in two forms: an `apply_*` method that
//! mutates an execution the caller already holds, and an id-based method
//! that loads the record, applies the change and writes it back.

mod alerts;
mod diagnostics;
mod health;
mod recovery;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use procura_core::{
    AlertType, BottleneckContext, Clock, DiagnosticContext, Diagnosis, ErrorEntry, ExecutionStatus,
    ExecutionStore, FailureReason, NotificationSink, StepName, StepStatus, TelemetrySettings,
    WorkflowExecution, WorkflowOutcome, WorkflowStep,
};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use alerts::{Alert, TrendSnapshot};
pub use diagnostics::{FailureClassifier, FailureSignal, Predicate};
pub use health::{AlertReport, BottleneckReport, FailureReport, HealthMetrics, HealthSummary};
pub use recovery::RecoveryPlan;

use crate::error::{OrchestratorError, Result};

/// Failure details recorded against a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl StepFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

impl From<&OrchestratorError> for StepFailure {
    fn from(err: &OrchestratorError) -> Self {
        Self::new(err.failure_reason(), err.to_string())
    }
}

/// Telemetry engine shared by every workflow in the process.
pub struct Telemetry {
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: TelemetrySettings,
    agent_name: String,
    classifier: FailureClassifier,
    /// Active system-level alerts and when they were raised.
    system_alerts: Mutex<HashMap<AlertType, DateTime<Utc>>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("settings", &self.settings)
            .field("agent_name", &self.agent_name)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(
        settings: TelemetrySettings,
        agent_name: impl Into<String>,
        store: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            settings,
            agent_name: agent_name.into(),
            classifier: FailureClassifier::default(),
            system_alerts: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    // ---------------------------------------------------------------------
    // Step progress
    // ---------------------------------------------------------------------

    /// Applies a step status change to an execution.
    ///
    /// `InProgress` starts a new attempt; `Completed`, `Failed` and
    /// `Skipped` finish the attempt in progress. A failure is recorded once,
    /// here: on the step, in the execution's failure context and in the
    /// bounded error history.
    pub fn apply_step_progress(
        &self,
        exec: &mut WorkflowExecution,
        step: StepName,
        status: StepStatus,
        failure: Option<&StepFailure>,
        metadata: Option<Value>,
    ) -> Result<()> {
        let now = self.clock.now();
        match status {
            StepStatus::Pending => {
                let attempt = exec.attempts(step) + 1;
                exec.steps.push(WorkflowStep::new(step, attempt));
            }
            StepStatus::InProgress => self.start_step(exec, step, now)?,
            StepStatus::Completed => {
                let index = Self::active_index(exec, step)?;
                exec.steps[index].mark_completed(now, metadata.unwrap_or(Value::Null));
                self.close_step(exec, index, now);
            }
            StepStatus::Failed => {
                let index = Self::active_index(exec, step)?;
                let failure = failure
                    .cloned()
                    .unwrap_or_else(|| StepFailure::new(FailureReason::StepError, "step failed"));
                exec.steps[index].mark_failed(now, failure.message.clone());
                if let Some(metadata) = metadata {
                    exec.steps[index].metadata = metadata;
                }
                self.close_step(exec, index, now);
                self.record_failure(exec, step, &failure, now);
            }
            StepStatus::Skipped => match Self::active_index(exec, step) {
                Ok(index) => exec.steps[index].mark_skipped(now),
                Err(_) => {
                    let mut skipped = WorkflowStep::new(step, exec.attempts(step) + 1);
                    skipped.mark_skipped(now);
                    exec.steps.push(skipped);
                }
            },
        }
        exec.updated_at = now;
        Ok(())
    }

    /// Loads an execution, applies a step status change and stores it.
    pub async fn update_step_progress(
        &self,
        workflow_id: &str,
        step: StepName,
        status: StepStatus,
        failure: Option<StepFailure>,
        metadata: Option<Value>,
    ) -> Result<WorkflowExecution> {
        let mut exec = self.load(workflow_id).await?;
        self.apply_step_progress(&mut exec, step, status, failure.as_ref(), metadata)?;
        self.store.upsert_execution(&exec).await?;
        Ok(exec)
    }

    fn start_step(&self, exec: &mut WorkflowExecution, step: StepName, now: DateTime<Utc>) -> Result<()> {
        if let Some(active) = exec.in_progress_step() {
            return Err(OrchestratorError::StepConflict { active: active.name, requested: step });
        }
        exec.transition_to(step.execution_status())?;

        let mut record = WorkflowStep::new(step, exec.attempts(step) + 1);
        record.mark_started(now);
        debug!(workflow_id = %exec.id, step = %step, attempt = record.attempt, "Step started");
        exec.steps.push(record);
        Ok(())
    }

    fn active_index(exec: &WorkflowExecution, step: StepName) -> Result<usize> {
        exec.steps
            .iter()
            .rposition(|record| record.name == step && record.is_in_progress())
            .ok_or(OrchestratorError::StepNotStarted(step))
    }

    fn close_step(&self, exec: &mut WorkflowExecution, index: usize, now: DateTime<Utc>) {
        let step = exec.steps[index].name;
        let Some(duration) = exec.steps[index].duration() else {
            return;
        };
        exec.add_phase_duration(step, duration);
        debug!(
            workflow_id = %exec.id,
            step = %step,
            status = ?exec.steps[index].status,
            duration_ms = duration.as_millis() as u64,
            "Step finished"
        );
        self.check_bottleneck(exec, step, duration, now);
    }

    /// Flags the execution when a finished step ran past its threshold.
    fn check_bottleneck(&self, exec: &mut WorkflowExecution, step: StepName, duration: Duration, now: DateTime<Utc>) {
        let threshold = self.settings.thresholds.for_step(step);
        if duration <= threshold {
            return;
        }
        let overage = duration - threshold;
        warn!(
            workflow_id = %exec.id,
            step = %step,
            duration_ms = duration.as_millis() as u64,
            overage_ms = overage.as_millis() as u64,
            "Step exceeded its duration threshold"
        );
        exec.bottleneck = BottleneckContext {
            detected: true,
            step: Some(step),
            duration_ms: Some(duration.as_millis() as u64),
            overage_ms: Some(overage.as_millis() as u64),
            detected_at: Some(now),
        };
    }

    fn record_failure(&self, exec: &mut WorkflowExecution, step: StepName, failure: &StepFailure, now: DateTime<Utc>) {
        exec.failure.reason = Some(failure.reason);
        exec.failure.step = Some(step);
        exec.failure.failure_count += 1;
        exec.push_error(
            ErrorEntry { step, reason: failure.reason, message: failure.message.clone(), at: now },
            self.settings.error_history_bound,
        );
        warn!(
            workflow_id = %exec.id,
            step = %step,
            reason = failure.reason.code(),
            failure_count = exec.failure.failure_count,
            error = %failure.message,
            "Step failed"
        );
    }

    // ---------------------------------------------------------------------
    // Response metrics
    // ---------------------------------------------------------------------

    /// Stores the latest contacted/responded counts on an execution.
    pub fn apply_response_metrics(&self, exec: &mut WorkflowExecution, contacted: u32, responded: u32) {
        let now = self.clock.now();
        exec.responses.contacted = contacted;
        exec.responses.responded = responded;
        exec.responses.response_rate =
            if contacted == 0 { 0.0 } else { f64::from(responded) / f64::from(contacted) };
        exec.responses.updated_at = Some(now);
        exec.updated_at = now;
    }

    /// Loads an execution, records response counts and stores it.
    pub async fn update_response_metrics(&self, workflow_id: &str, contacted: u32, responded: u32) -> Result<()> {
        let mut exec = self.load(workflow_id).await?;
        self.apply_response_metrics(&mut exec, contacted, responded);
        self.store.upsert_execution(&exec).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    /// Moves an execution to a terminal status and stamps completion.
    pub fn apply_completion(
        &self,
        exec: &mut WorkflowExecution,
        terminal_status: ExecutionStatus,
        outcome: WorkflowOutcome,
        metadata: Option<Value>,
    ) -> Result<()> {
        if !terminal_status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(procura_core::TransitionError {
                from: exec.status,
                to: terminal_status,
            }));
        }
        exec.transition_to(terminal_status)?;

        let now = self.clock.now();
        exec.completed_at = Some(now);
        exec.outcome = Some(outcome);
        exec.updated_at = now;
        if let Some(Value::Object(extra)) = metadata {
            exec.metadata.extend(extra);
        }

        info!(
            workflow_id = %exec.id,
            status = %terminal_status,
            outcome = outcome.description(),
            duration_ms = procura_core::clock::elapsed_between(exec.started_at, now).as_millis() as u64,
            "Workflow finished"
        );
        Ok(())
    }

    /// Loads an execution, completes it and stores it.
    pub async fn complete_workflow(
        &self,
        workflow_id: &str,
        terminal_status: ExecutionStatus,
        outcome: WorkflowOutcome,
        metadata: Option<Value>,
    ) -> Result<WorkflowExecution> {
        let mut exec = self.load(workflow_id).await?;
        self.apply_completion(&mut exec, terminal_status, outcome, metadata)?;
        self.store.upsert_execution(&exec).await?;
        Ok(exec)
    }

    // ---------------------------------------------------------------------
    // Diagnostics and recovery bookkeeping
    // ---------------------------------------------------------------------

    /// Classifies a failure and attaches the diagnosis to the execution.
    pub fn diagnose(&self, exec: &mut WorkflowExecution, step: StepName, failure: &StepFailure) -> Diagnosis {
        let now = self.clock.now();
        let signal = FailureSignal::new(Some(failure.reason), Some(step), &failure.message);
        let category = self.classifier.classify(&signal);
        let diagnosis = Diagnosis::new(category, step, failure.message.clone(), now);

        info!(
            workflow_id = %exec.id,
            step = %step,
            category = category.as_str(),
            severity = ?diagnosis.severity,
            auto_recoverable = diagnosis.auto_recoverable,
            "Failure diagnosed"
        );

        let mut remediations = exec.diagnostics.suggested_remediations.clone();
        if !remediations.contains(&diagnosis.remediation) {
            remediations.push(diagnosis.remediation.clone());
        }
        exec.diagnostics = DiagnosticContext { diagnosis: Some(diagnosis.clone()), suggested_remediations: remediations };
        exec.updated_at = now;
        diagnosis
    }

    /// Marks an automated recovery as attempted with the given actions.
    pub fn record_recovery_attempt(&self, exec: &mut WorkflowExecution, actions: Vec<String>) {
        let now = self.clock.now();
        exec.recovery.attempted = true;
        exec.recovery.actions = actions;
        exec.recovery.succeeded = None;
        exec.recovery.attempted_at = Some(now);
        exec.updated_at = now;
    }

    /// Records how the recovery attempt ended.
    pub fn record_recovery_outcome(&self, exec: &mut WorkflowExecution, succeeded: bool) {
        exec.recovery.succeeded = Some(succeeded);
        exec.updated_at = self.clock.now();
        info!(workflow_id = %exec.id, succeeded, "Recovery attempt finished");
    }

    /// Records whether the delivered deliverable was accepted downstream.
    pub async fn record_deliverable_outcome(&self, workflow_id: &str, accepted: bool) -> Result<()> {
        let mut exec = self.load(workflow_id).await?;
        exec.deliverable_accepted = Some(accepted);
        exec.updated_at = self.clock.now();
        self.store.upsert_execution(&exec).await?;
        debug!(workflow_id = %workflow_id, accepted, "Deliverable outcome recorded");
        Ok(())
    }

    /// Clears an execution's alert guard. Returns whether an alert was active.
    pub async fn resolve_alert(&self, workflow_id: &str) -> Result<bool> {
        let mut exec = self.load(workflow_id).await?;
        if !exec.alert.raised {
            return Ok(false);
        }
        info!(workflow_id = %workflow_id, alert_type = ?exec.alert.alert_type, "Alert resolved");
        exec.alert = procura_core::AlertContext::default();
        exec.updated_at = self.clock.now();
        self.store.upsert_execution(&exec).await?;
        Ok(true)
    }

    /// Sends a human-readable status message. Failures are logged only.
    pub async fn notify(&self, message: &str, data: &Value) {
        if let Err(err) = self.notifier.notify(&self.agent_name, message, data).await {
            warn!(error = %err, "Notification failed");
        }
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowExecution> {
        self.store
            .get_execution(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(workflow_id.to_string()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
