//! Runs one workflow phase as a tracked step.

use std::future::Future;
use std::sync::Arc;

use procura_core::{FailureReason, StepName, StepStatus, WorkflowExecution};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::error::{OrchestratorError, Result};
use crate::telemetry::{StepFailure, Telemetry};

/// A failed phase. The failure has already been recorded on the execution
/// by the time the caller sees this value.
#[derive(Debug, Error)]
#[error("{step} failed: {error}")]
pub struct PhaseFailure {
    pub step: StepName,
    pub reason: FailureReason,
    #[source]
    pub error: OrchestratorError,
}

impl PhaseFailure {
    pub fn new(step: StepName, error: OrchestratorError) -> Self {
        Self { step, reason: error.failure_reason(), error }
    }

    pub fn to_step_failure(&self) -> StepFailure {
        StepFailure::new(self.reason, self.error.to_string())
    }
}

/// Wraps phases with status tracking, timestamps and failure capture.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    telemetry: Arc<Telemetry>,
}

impl StepExecutor {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self { telemetry }
    }

    /// Runs `operation` as `step`. The operation returns its value together
    /// with the metadata stored on the completed step.
    pub async fn run<T, F, Fut>(
        &self,
        exec: &mut WorkflowExecution,
        step: StepName,
        operation: F,
    ) -> std::result::Result<T, PhaseFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Value)>>,
    {
        self.begin(exec, step).await?;
        match operation().await {
            Ok((value, metadata)) => {
                self.complete(exec, step, metadata).await?;
                Ok(value)
            }
            Err(err) => Err(self.fail(exec, step, err).await),
        }
    }

    /// Starts `step` and persists the execution.
    ///
    /// Starting a step on a finished execution, or while another step is in
    /// progress, is refused without touching the record.
    pub async fn begin(&self, exec: &mut WorkflowExecution, step: StepName) -> std::result::Result<(), PhaseFailure> {
        self.telemetry
            .apply_step_progress(exec, step, StepStatus::InProgress, None, None)
            .map_err(|err| PhaseFailure::new(step, err))?;
        if let Err(err) = self.persist(exec).await {
            return Err(self.fail(exec, step, err).await);
        }
        Ok(())
    }

    /// Completes the step in progress with its result metadata.
    pub async fn complete(
        &self,
        exec: &mut WorkflowExecution,
        step: StepName,
        metadata: Value,
    ) -> std::result::Result<(), PhaseFailure> {
        self.telemetry
            .apply_step_progress(exec, step, StepStatus::Completed, None, Some(metadata))
            .map_err(|err| PhaseFailure::new(step, err))?;
        self.persist(exec).await.map_err(|err| PhaseFailure::new(step, err))
    }

    /// Fails the step in progress, recording the failure once.
    pub async fn fail(&self, exec: &mut WorkflowExecution, step: StepName, err: OrchestratorError) -> PhaseFailure {
        let failure = PhaseFailure::new(step, err);
        if let Err(record_err) =
            self.telemetry
                .apply_step_progress(exec, step, StepStatus::Failed, Some(&failure.to_step_failure()), None)
        {
            error!(workflow_id = %exec.id, step = %step, error = %record_err, "Could not record step failure");
        }
        if let Err(persist_err) = self.persist(exec).await {
            error!(workflow_id = %exec.id, error = %persist_err, "Could not persist step failure");
        }
        failure
    }

    /// Writes the execution to the store.
    pub async fn persist(&self, exec: &WorkflowExecution) -> Result<()> {
        self.telemetry.store().upsert_execution(exec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_core::{
        Clock, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, ManualClock, TelemetrySettings,
        TracingNotifier,
    };
    use serde_json::json;

    fn executor() -> (StepExecutor, Arc<InMemoryExecutionStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryExecutionStore::new());
        let telemetry = Arc::new(Telemetry::new(
            TelemetrySettings::default(),
            "procura",
            store.clone(),
            Arc::new(TracingNotifier),
            clock.clone(),
        ));
        (StepExecutor::new(telemetry), store, clock)
    }

    #[tokio::test]
    async fn test_run_stamps_and_persists() {
        let (executor, store, clock) = executor();
        let mut exec = WorkflowExecution::new("wf-1", None, clock.now());

        let contacted = executor
            .run(&mut exec, StepName::Contact, || async { Ok((3_u32, json!({ "contacted": 3 }))) })
            .await
            .unwrap();

        assert_eq!(contacted, 3);
        assert_eq!(exec.status, ExecutionStatus::Contacted);
        let step = &exec.steps[0];
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.ended_at >= step.started_at);
        assert_eq!(step.metadata["contacted"], 3);

        let stored = store.get_execution("wf-1").await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_recorded_once_and_returned() {
        let (executor, store, clock) = executor();
        let mut exec = WorkflowExecution::new("wf-1", None, clock.now());

        let failure = executor
            .run(&mut exec, StepName::Contact, || async {
                Err::<((), Value), _>(OrchestratorError::NoEligibleRecipients)
            })
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::NoEligibleRecipients);
        assert_eq!(exec.failure.failure_count, 1);
        assert_eq!(exec.failure.error_history.len(), 1);
        assert_eq!(exec.steps[0].status, StepStatus::Failed);

        let stored = store.get_execution("wf-1").await.unwrap().unwrap();
        assert_eq!(stored.failure.failure_count, 1);
    }

    #[tokio::test]
    async fn test_refuses_to_run_after_terminal() {
        let (executor, _store, clock) = executor();
        let mut exec = WorkflowExecution::new("wf-1", None, clock.now());
        exec.transition_to(ExecutionStatus::Completed).unwrap();

        let failure = executor
            .run(&mut exec, StepName::Generation, || async { Ok(((), Value::Null)) })
            .await
            .unwrap_err();

        assert!(matches!(failure.error, OrchestratorError::InvalidTransition(_)));
        assert!(exec.steps.is_empty());
        assert_eq!(exec.failure.failure_count, 0);
    }
}
