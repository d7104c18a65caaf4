//! End-to-end workflow orchestration.
//!
//! Drives an execution through detection, contact, response collection,
//! deliverable generation, human approval and delivery. Every external call
//! goes through the dependency's circuit breaker and the retry policy, every
//! phase is tracked as a step, and an unrecoverable failure ends in exactly
//! one escalation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use procura_core::clock::elapsed_between;
use procura_core::{
    Artifact, BusinessRecords, Clock, ContactService, DeliverableRef, DeliverableService, DeliveryService,
    Detection, DetectionService, EngineConfig, ExecutionStatus, ExecutionStore, NotificationSink, RecordStatus,
    Response, ResponseQuery, ServiceError, StepName, TaskSink, WorkflowExecution, WorkflowOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::escalation::Escalator;
use crate::monitor::ResponseMonitor;
use crate::resilience::{
    BreakerRegistry, CircuitBreakerState, CircuitState, InMemoryBreakerRegistry, RetryPolicy, guarded_call,
};
use crate::step_executor::{PhaseFailure, StepExecutor};
use crate::telemetry::{RecoveryPlan, Telemetry};

type PhaseResult<T> = std::result::Result<T, PhaseFailure>;

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub detection: Arc<dyn DetectionService>,
    pub contact: Arc<dyn ContactService>,
    pub responses: Arc<dyn ResponseQuery>,
    pub deliverables: Arc<dyn DeliverableService>,
    pub tasks: Arc<dyn TaskSink>,
    pub delivery: Arc<dyn DeliveryService>,
    pub records: Arc<dyn BusinessRecords>,
    pub notifier: Arc<dyn NotificationSink>,
    pub store: Arc<dyn ExecutionStore>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Human decision on a generated deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    /// Approved after the reviewer changed the deliverable.
    Edited,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "edited" => Ok(Self::Edited),
            other => Err(format!("unknown approval decision: {other}")),
        }
    }
}

/// Result of [`WorkflowOrchestrator::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    pub success: bool,
    pub workflow_id: String,
    pub business_record_id: Option<String>,
    pub status: ExecutionStatus,
    pub outcome: Option<WorkflowOutcome>,
    pub error: Option<String>,
}

/// Result of [`WorkflowOrchestrator::resolve_approval`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub success: bool,
    pub workflow_id: String,
    /// `None` when the workflow could not be loaded.
    pub status: Option<ExecutionStatus>,
    pub outcome: Option<WorkflowOutcome>,
    pub error: Option<String>,
}

/// Per-run adjustments made by a recovery plan.
#[derive(Debug, Clone, Default)]
struct PhaseOverrides {
    response_window: Option<Duration>,
    delivery_retry: Option<RetryPolicy>,
}

/// Top-level workflow orchestrator.
pub struct WorkflowOrchestrator {
    config: EngineConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    breakers: Arc<dyn BreakerRegistry>,
    retry: RetryPolicy,
    telemetry: Arc<Telemetry>,
    steps: StepExecutor,
    monitor: ResponseMonitor,
    escalator: Escalator,
}

impl fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("agent_name", &self.config.orchestrator.agent_name)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let agent_name = config.orchestrator.agent_name.clone();
        let telemetry = Arc::new(Telemetry::new(
            config.telemetry.clone(),
            agent_name.clone(),
            collaborators.store.clone(),
            collaborators.notifier.clone(),
            clock.clone(),
        ));
        let retry = RetryPolicy::new(config.retry.clone(), clock.clone());
        let monitor = ResponseMonitor::new(
            &config.monitor,
            collaborators.responses.clone(),
            telemetry.clone(),
            retry.clone(),
            clock.clone(),
        );
        let escalator = Escalator::new(
            collaborators.tasks.clone(),
            collaborators.notifier.clone(),
            config.orchestrator.escalation_owner.clone(),
            agent_name,
        );

        Self {
            breakers: Arc::new(InMemoryBreakerRegistry::new(&config.breaker, clock.clone())),
            steps: StepExecutor::new(telemetry.clone()),
            config,
            collaborators,
            clock,
            retry,
            telemetry,
            monitor,
            escalator,
        }
    }

    /// Shares a breaker registry across orchestrators.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<dyn BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn breakers(&self) -> &Arc<dyn BreakerRegistry> {
        &self.breakers
    }

    /// Runs a new workflow for an inbound trigger.
    ///
    /// Returns once the workflow finishes, fails, or parks waiting for
    /// human approval.
    pub async fn start(&self, trigger_id: &str) -> StartResult {
        let mut exec = WorkflowExecution::new(Uuid::new_v4().to_string(), Some(trigger_id.to_string()), self.clock.now());
        info!(workflow_id = %exec.id, trigger_id = %trigger_id, "Starting workflow");

        if let Err(err) = self.steps.persist(&exec).await {
            error!(workflow_id = %exec.id, error = %err, "Could not create execution record");
            return StartResult {
                success: false,
                workflow_id: exec.id,
                business_record_id: None,
                status: exec.status,
                outcome: None,
                error: Some(err.to_string()),
            };
        }

        let result = match self.run_forward(&mut exec, StepName::Detection, &PhaseOverrides::default()).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => self.handle_failure(&mut exec, failure).await,
        };

        StartResult {
            success: result.is_ok(),
            workflow_id: exec.id.clone(),
            business_record_id: exec.business_record_id.clone(),
            status: exec.status,
            outcome: exec.outcome,
            error: result.err().map(|failure| failure.to_string()),
        }
    }

    /// Applies a human decision to a workflow waiting on approval.
    ///
    /// Unknown workflows, a mismatched business record, or a workflow not
    /// waiting on approval are reported back without escalation.
    pub async fn resolve_approval(
        &self,
        business_record_id: &str,
        workflow_id: &str,
        decision: ApprovalDecision,
    ) -> ApprovalResult {
        let mut exec = match self.load_pending_approval(business_record_id, workflow_id).await {
            Ok(exec) => exec,
            Err(err) => {
                warn!(workflow_id = %workflow_id, error = %err, "Approval refused");
                return ApprovalResult {
                    success: false,
                    workflow_id: workflow_id.to_string(),
                    status: None,
                    outcome: None,
                    error: Some(err.to_string()),
                };
            }
        };
        info!(workflow_id = %workflow_id, decision = %decision, "Approval decision received");

        let result = match decision {
            ApprovalDecision::Rejected => self.reject(&mut exec).await,
            ApprovalDecision::Approved | ApprovalDecision::Edited => self.approve(&mut exec, decision).await,
        };
        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(failure) => self.handle_failure(&mut exec, failure).await,
        };

        ApprovalResult {
            success: result.is_ok(),
            workflow_id: exec.id.clone(),
            status: Some(exec.status),
            outcome: exec.outcome,
            error: result.err().map(|failure| failure.to_string()),
        }
    }

    async fn load_pending_approval(
        &self,
        business_record_id: &str,
        workflow_id: &str,
    ) -> crate::error::Result<WorkflowExecution> {
        let exec = self
            .collaborators
            .store
            .get_execution(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(workflow_id.to_string()))?;

        if exec.business_record_id.as_deref() != Some(business_record_id) {
            return Err(OrchestratorError::ApprovalMismatch {
                workflow_id: workflow_id.to_string(),
                business_record_id: business_record_id.to_string(),
            });
        }
        if exec.status != ExecutionStatus::PendingApproval {
            return Err(OrchestratorError::NotAwaitingApproval {
                workflow_id: workflow_id.to_string(),
                status: exec.status,
            });
        }
        Ok(exec)
    }

    // ---------------------------------------------------------------------
    // Forward path
    // ---------------------------------------------------------------------

    /// Runs the phase sequence from `from` until the workflow finishes or
    /// parks on approval.
    async fn run_forward(
        &self,
        exec: &mut WorkflowExecution,
        from: StepName,
        overrides: &PhaseOverrides,
    ) -> PhaseResult<WorkflowOutcome> {
        if from <= StepName::Detection {
            if let Some(outcome) = self.detect(exec).await? {
                return Ok(outcome);
            }
        }
        if from <= StepName::Contact {
            self.contact(exec).await?;
        }
        if from <= StepName::ResponseWait {
            self.await_responses(exec, overrides.response_window).await?;
        }
        if from <= StepName::Generation {
            self.generate(exec).await?;
        }
        if from <= StepName::Approval {
            self.request_approval(exec).await?;
            return Ok(WorkflowOutcome::AwaitingApproval);
        }
        self.deliver(exec, overrides.delivery_retry.as_ref()).await
    }

    /// Classifies the trigger and applies the confidence gates. Returns the
    /// outcome when the workflow ends here.
    async fn detect(&self, exec: &mut WorkflowExecution) -> PhaseResult<Option<WorkflowOutcome>> {
        let trigger_id = exec.trigger_id.clone().unwrap_or_default();
        let auto_proceed = self.config.orchestrator.auto_proceed_confidence;

        let detection: Detection = self
            .steps
            .run(exec, StepName::Detection, move || async move {
                let detection = guarded_call(&*self.breakers, &self.retry, dependency(StepName::Detection), || {
                    self.collaborators.detection.classify(&trigger_id)
                })
                .await?;
                if detection.is_match && detection.confidence > auto_proceed && detection.business_record_id.is_none() {
                    return Err(OrchestratorError::MissingBusinessRecord);
                }
                let metadata = json!({
                    "is_match": detection.is_match,
                    "confidence": detection.confidence,
                    "business_record_id": detection.business_record_id,
                    "extracted_data": detection.extracted_data,
                });
                Ok((detection, metadata))
            })
            .await?;

        exec.business_record_id.clone_from(&detection.business_record_id);

        let gates = &self.config.orchestrator;
        let outcome = if !detection.is_match
            || !detection.confidence.is_finite()
            || detection.confidence < gates.min_confidence
        {
            WorkflowOutcome::NotApplicable
        } else if detection.confidence <= gates.auto_proceed_confidence {
            WorkflowOutcome::ManualReview
        } else {
            return Ok(None);
        };

        self.finish(exec, StepName::Detection, outcome, json!({ "confidence": detection.confidence })).await?;
        Ok(Some(outcome))
    }

    async fn contact(&self, exec: &mut WorkflowExecution) -> PhaseResult<()> {
        let record = exec.business_record_id.clone();

        let contacted = self
            .steps
            .run(exec, StepName::Contact, move || async move {
                let record = record.ok_or(OrchestratorError::MissingBusinessRecord)?;
                let contacted = guarded_call(&*self.breakers, &self.retry, dependency(StepName::Contact), || {
                    self.collaborators.contact.dispatch(&record)
                })
                .await?;
                if contacted == 0 {
                    return Err(OrchestratorError::NoEligibleRecipients);
                }
                Ok((contacted, json!({ "contacted": contacted })))
            })
            .await?;

        self.telemetry.apply_response_metrics(exec, contacted, 0);
        self.persist_or_fail(exec, StepName::Contact).await
    }

    async fn await_responses(&self, exec: &mut WorkflowExecution, window: Option<Duration>) -> PhaseResult<()> {
        self.steps.begin(exec, StepName::ResponseWait).await?;

        let Some(record) = exec.business_record_id.clone() else {
            return Err(self.steps.fail(exec, StepName::ResponseWait, OrchestratorError::MissingBusinessRecord).await);
        };
        let window = window.unwrap_or_else(|| self.monitor.window());
        let result = self.monitor.collect_within(&record, &exec.id, window).await;

        // The monitor heartbeats metrics into the stored record while it waits.
        self.refresh(exec).await;

        match result {
            Ok(collected) => {
                self.telemetry.apply_response_metrics(exec, collected.contacted, collected.responses_received);
                let metadata = json!({
                    "responses_received": collected.responses_received,
                    "contacted": collected.contacted,
                    "timed_out": collected.timed_out,
                    "reason": collected.reason.as_str(),
                    "window_secs": window.as_secs(),
                });
                self.steps.complete(exec, StepName::ResponseWait, metadata).await
            }
            Err(err) => Err(self.steps.fail(exec, StepName::ResponseWait, err).await),
        }
    }

    async fn generate(&self, exec: &mut WorkflowExecution) -> PhaseResult<()> {
        let record = exec.business_record_id.clone();

        let artifact: Artifact = self
            .steps
            .run(exec, StepName::Generation, move || async move {
                let record = record.ok_or(OrchestratorError::MissingBusinessRecord)?;
                let responses = self
                    .retry
                    .execute(|| self.collaborators.responses.list_responses(&record))
                    .await
                    .map_err(OrchestratorError::service("response-query"))?;
                if responses.is_empty() {
                    return Err(OrchestratorError::NoResponses);
                }

                let artifact = guarded_call(&*self.breakers, &self.retry, dependency(StepName::Generation), || {
                    self.collaborators.deliverables.generate(&record)
                })
                .await?;

                let mut metadata = aggregate_responses(&responses);
                metadata["artifact_id"] = json!(artifact.artifact_id);
                metadata["artifact_url"] = json!(artifact.artifact_url);
                Ok((artifact, metadata))
            })
            .await?;

        exec.deliverable = Some(DeliverableRef { artifact_id: artifact.artifact_id, artifact_url: artifact.artifact_url });
        self.persist_or_fail(exec, StepName::Generation).await
    }

    /// Opens the approval step and hands the deliverable to a human. The
    /// step stays in progress until the decision arrives.
    async fn request_approval(&self, exec: &mut WorkflowExecution) -> PhaseResult<()> {
        self.steps.begin(exec, StepName::Approval).await?;

        let (Some(record), Some(deliverable)) = (exec.business_record_id.clone(), exec.deliverable.clone()) else {
            return Err(self.steps.fail(exec, StepName::Approval, OrchestratorError::MissingDeliverable).await);
        };
        let timeline = approval_timeline(exec);

        let task = self
            .retry
            .execute(|| {
                self.collaborators.tasks.create_or_update_approval_task(
                    &record,
                    &exec.id,
                    &deliverable.artifact_url,
                    &timeline,
                )
            })
            .await;

        match task {
            Ok(task_id) => {
                info!(workflow_id = %exec.id, task_id = %task_id, "Approval requested");
                exec.approval_task_id = Some(task_id.clone());
                exec.outcome = Some(WorkflowOutcome::AwaitingApproval);
                if let Err(err) = self.steps.persist(exec).await {
                    return Err(self.steps.fail(exec, StepName::Approval, err).await);
                }
                self.telemetry
                    .notify(
                        &format!("Deliverable for {record} is ready for approval"),
                        &json!({ "workflow_id": exec.id, "task_id": task_id, "artifact_url": deliverable.artifact_url }),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                let err = OrchestratorError::service("approval-task")(err);
                Err(self.steps.fail(exec, StepName::Approval, err).await)
            }
        }
    }

    async fn approve(&self, exec: &mut WorkflowExecution, decision: ApprovalDecision) -> PhaseResult<WorkflowOutcome> {
        self.close_approval(exec, decision).await?;
        self.run_forward(exec, StepName::Send, &PhaseOverrides::default()).await
    }

    async fn reject(&self, exec: &mut WorkflowExecution) -> PhaseResult<WorkflowOutcome> {
        let Some(record) = exec.business_record_id.clone() else {
            return Err(self.steps.fail(exec, StepName::Approval, OrchestratorError::MissingBusinessRecord).await);
        };

        let marked = self
            .retry
            .execute(|| self.collaborators.records.mark_status(&record, RecordStatus::Rejected))
            .await;
        if let Err(err) = marked {
            let err = OrchestratorError::service("business-records")(err);
            return Err(self.steps.fail(exec, StepName::Approval, err).await);
        }

        self.close_approval(exec, ApprovalDecision::Rejected).await?;
        self.finish(exec, StepName::Approval, WorkflowOutcome::Rejected, json!({ "decision": "rejected" })).await?;
        Ok(WorkflowOutcome::Rejected)
    }

    async fn close_approval(&self, exec: &mut WorkflowExecution, decision: ApprovalDecision) -> PhaseResult<()> {
        let open = exec.in_progress_step().is_some_and(|step| step.name == StepName::Approval);
        if !open {
            warn!(workflow_id = %exec.id, "No approval step in progress; recording decision only");
            exec.metadata.insert("approval_decision".to_string(), json!(decision));
            return Ok(());
        }
        self.steps.complete(exec, StepName::Approval, json!({ "decision": decision })).await
    }

    /// Sends the approved deliverable, marks the record sent and schedules
    /// the follow-up. Progress past the send is kept on the execution, so
    /// re-entering after a later failure never sends the artifact twice.
    async fn deliver(&self, exec: &mut WorkflowExecution, retry: Option<&RetryPolicy>) -> PhaseResult<WorkflowOutcome> {
        self.steps.begin(exec, StepName::Send).await?;

        let Some(record) = exec.business_record_id.clone() else {
            return Err(self.steps.fail(exec, StepName::Send, OrchestratorError::MissingBusinessRecord).await);
        };
        let Some(deliverable) = exec.deliverable.clone() else {
            return Err(self.steps.fail(exec, StepName::Send, OrchestratorError::MissingDeliverable).await);
        };
        let artifact = Artifact { artifact_id: deliverable.artifact_id, artifact_url: deliverable.artifact_url };
        let records = &self.collaborators.records;

        let recipient = match sent_to(exec) {
            Some(recipient) => {
                info!(workflow_id = %exec.id, recipient = %recipient, "Deliverable already sent, resuming after send");
                recipient
            }
            None => {
                let sent = self.send_deliverable(&record, &artifact, retry.unwrap_or(&self.retry)).await;
                let recipient = match sent {
                    Ok(recipient) => recipient,
                    Err(err) => return Err(self.steps.fail(exec, StepName::Send, err).await),
                };
                exec.metadata.insert(
                    DELIVERY_PROGRESS.to_string(),
                    json!({ "recipient": recipient, "sent_at": self.clock.now(), "record_marked": false }),
                );
                self.persist_or_fail(exec, StepName::Send).await?;
                recipient
            }
        };

        if !record_marked(exec) {
            let marked = self.retry.execute(|| records.mark_status(&record, RecordStatus::Sent)).await;
            if let Err(err) = marked {
                let err = OrchestratorError::service("business-records")(err);
                return Err(self.steps.fail(exec, StepName::Send, err).await);
            }
            if let Some(progress) = exec.metadata.get_mut(DELIVERY_PROGRESS) {
                progress["record_marked"] = json!(true);
            }
            self.persist_or_fail(exec, StepName::Send).await?;
        }

        let due_at = self.clock.now() + chrono::Duration::days(i64::from(self.config.orchestrator.follow_up_days));
        let follow_up_id = match self.retry.execute(|| records.schedule_follow_up(&record, due_at)).await {
            Ok(follow_up_id) => follow_up_id,
            Err(err) => {
                let err = OrchestratorError::service("business-records")(err);
                return Err(self.steps.fail(exec, StepName::Send, err).await);
            }
        };

        let metadata = json!({
            "recipient": recipient,
            "artifact_id": artifact.artifact_id,
            "follow_up_id": follow_up_id,
            "follow_up_due_at": due_at,
        });
        self.steps.complete(exec, StepName::Send, metadata).await?;

        exec.follow_up_id = Some(follow_up_id);
        self.finish(exec, StepName::Send, WorkflowOutcome::Delivered, json!({ "follow_up_due_at": due_at })).await?;
        Ok(WorkflowOutcome::Delivered)
    }

    /// Resolves the recipient and sends through the delivery breaker.
    /// A receipt reporting failure counts as a failed send.
    async fn send_deliverable(
        &self,
        record: &str,
        artifact: &Artifact,
        retry: &RetryPolicy,
    ) -> crate::error::Result<String> {
        let recipient = self
            .retry
            .execute(|| self.collaborators.records.recipient(record))
            .await
            .map_err(OrchestratorError::service("business-records"))?;

        let delivery = &self.collaborators.delivery;
        let recipient_ref = &recipient;
        guarded_call(&*self.breakers, retry, dependency(StepName::Send), || async move {
            let receipt = delivery.send(recipient_ref, artifact).await?;
            if receipt.success {
                Ok(receipt)
            } else {
                let reason = receipt.error.unwrap_or_else(|| "unknown error".to_string());
                Err(ServiceError::with_code("DELIVERY_REJECTED", format!("delivery rejected: {reason}")))
            }
        })
        .await?;

        Ok(recipient)
    }

    /// Completes the workflow successfully with `outcome`.
    async fn finish(
        &self,
        exec: &mut WorkflowExecution,
        step: StepName,
        outcome: WorkflowOutcome,
        metadata: Value,
    ) -> PhaseResult<()> {
        self.telemetry
            .apply_completion(exec, ExecutionStatus::Completed, outcome, Some(metadata))
            .map_err(|err| PhaseFailure::new(step, err))?;
        if let Err(err) = self.steps.persist(exec).await {
            error!(workflow_id = %exec.id, error = %err, "Could not persist completed workflow");
        }
        self.telemetry
            .notify(
                &format!("Workflow {} finished: {}", exec.id, outcome.description()),
                &json!({ "workflow_id": exec.id, "business_record_id": exec.business_record_id, "outcome": outcome }),
            )
            .await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Failure handling
    // ---------------------------------------------------------------------

    /// Diagnoses a failed phase, attempts one automated recovery when the
    /// failure allows it, and otherwise fails and escalates the workflow.
    async fn handle_failure(&self, exec: &mut WorkflowExecution, failure: PhaseFailure) -> PhaseResult<WorkflowOutcome> {
        if exec.is_terminal() {
            warn!(workflow_id = %exec.id, status = %exec.status, error = %failure, "Failure on finished workflow ignored");
            return Err(failure);
        }

        let diagnosis = self.telemetry.diagnose(exec, failure.step, &failure.to_step_failure());
        let mut failure = failure;

        let plan = (diagnosis.auto_recoverable && !exec.recovery.attempted)
            .then(|| RecoveryPlan::for_failure(diagnosis.category, failure.step, &self.config))
            .flatten();

        if let Some(plan) = plan {
            match self.recover(exec, &plan).await {
                Ok(outcome) => {
                    self.telemetry.record_recovery_outcome(exec, true);
                    if let Err(err) = self.steps.persist(exec).await {
                        error!(workflow_id = %exec.id, error = %err, "Could not persist recovery outcome");
                    }
                    return Ok(outcome);
                }
                Err(second) => {
                    self.telemetry.record_recovery_outcome(exec, false);
                    if exec.is_terminal() {
                        return Err(second);
                    }
                    self.telemetry.diagnose(exec, second.step, &second.to_step_failure());
                    failure = second;
                }
            }
        }

        self.fail_workflow(exec, &failure).await;
        Err(failure)
    }

    async fn recover(&self, exec: &mut WorkflowExecution, plan: &RecoveryPlan) -> PhaseResult<WorkflowOutcome> {
        let resume = plan.resume_step();
        self.telemetry.record_recovery_attempt(exec, plan.actions());
        exec.transition_to(ExecutionStatus::Recovering).map_err(|err| PhaseFailure::new(resume, err.into()))?;
        if let Err(err) = self.steps.persist(exec).await {
            error!(workflow_id = %exec.id, error = %err, "Could not persist recovery attempt");
        }
        info!(workflow_id = %exec.id, plan = ?plan, "Attempting automated recovery");

        match plan {
            RecoveryPlan::RetryAfterCooldown { step, cooldown } => {
                let remaining = self.remaining_cooldown(*step, *cooldown).await;
                if !remaining.is_zero() {
                    self.clock.sleep(remaining).await;
                }
                self.run_forward(exec, *step, &PhaseOverrides::default()).await
            }
            RecoveryPlan::RetryWithExtendedDeadline { step, response_window } => {
                let overrides = PhaseOverrides { response_window: *response_window, ..PhaseOverrides::default() };
                self.run_forward(exec, *step, &overrides).await
            }
            RecoveryPlan::RetryDelivery { step, policy } => {
                let overrides = PhaseOverrides {
                    delivery_retry: Some(RetryPolicy::new(policy.clone(), self.clock.clone())),
                    ..PhaseOverrides::default()
                };
                self.run_forward(exec, *step, &overrides).await
            }
            RecoveryPlan::NudgeAndExtend { extension } => {
                self.nudge(exec).await?;
                let overrides = PhaseOverrides { response_window: Some(*extension), ..PhaseOverrides::default() };
                self.run_forward(exec, StepName::ResponseWait, &overrides).await
            }
        }
    }

    /// Time until the step's breaker may move to half-open. A breaker that is
    /// no longer open needs no wait.
    async fn remaining_cooldown(&self, step: StepName, cooldown: Duration) -> Duration {
        match self.breakers.state(dependency(step)).await {
            CircuitBreakerState { state: CircuitState::Open, last_failure_at: Some(at), .. } => {
                cooldown.saturating_sub(elapsed_between(at, self.clock.now()))
            }
            CircuitBreakerState { state: CircuitState::Open, .. } => cooldown,
            _ => Duration::ZERO,
        }
    }

    /// Reminds non-responders; tracked as another contact attempt.
    async fn nudge(&self, exec: &mut WorkflowExecution) -> PhaseResult<()> {
        let record = exec.business_record_id.clone();
        self.steps
            .run(exec, StepName::Contact, move || async move {
                let record = record.ok_or(OrchestratorError::MissingBusinessRecord)?;
                let nudged = guarded_call(&*self.breakers, &self.retry, dependency(StepName::Contact), || {
                    self.collaborators.contact.nudge_non_responders(&record)
                })
                .await?;
                Ok(((), json!({ "nudged": nudged })))
            })
            .await
    }

    /// Marks the workflow failed and escalates it exactly once.
    async fn fail_workflow(&self, exec: &mut WorkflowExecution, failure: &PhaseFailure) {
        if let Err(err) = self.telemetry.apply_completion(
            exec,
            ExecutionStatus::Failed,
            WorkflowOutcome::Failed,
            Some(json!({ "failure_reason": failure.reason.code() })),
        ) {
            error!(workflow_id = %exec.id, error = %err, "Could not mark workflow failed");
        }
        if let Err(err) = self.steps.persist(exec).await {
            error!(workflow_id = %exec.id, error = %err, "Could not persist failed workflow");
        }

        let error_text = failure.error.to_string();
        match exec.business_record_id.clone() {
            Some(record) => {
                self.escalator.escalate(&record, failure.reason, &error_text).await;
            }
            None => {
                self.telemetry
                    .notify(
                        &format!("Workflow {} failed before a business record existed", exec.id),
                        &json!({ "workflow_id": exec.id, "reason": failure.reason.code(), "error": error_text }),
                    )
                    .await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Reloads the execution from the store, keeping the local copy when the
    /// store has nothing newer.
    async fn refresh(&self, exec: &mut WorkflowExecution) {
        match self.collaborators.store.get_execution(&exec.id).await {
            Ok(Some(stored)) => *exec = stored,
            Ok(None) => warn!(workflow_id = %exec.id, "Execution missing from store during refresh"),
            Err(err) => warn!(workflow_id = %exec.id, error = %err, "Could not refresh execution"),
        }
    }

    async fn persist_or_fail(&self, exec: &mut WorkflowExecution, step: StepName) -> PhaseResult<()> {
        match self.steps.persist(exec).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(workflow_id = %exec.id, step = %step, error = %err, "Could not persist phase result");
                Err(PhaseFailure::new(step, err))
            }
        }
    }
}

/// Execution metadata key tracking how far delivery got.
const DELIVERY_PROGRESS: &str = "delivery_progress";

fn sent_to(exec: &WorkflowExecution) -> Option<String> {
    exec.metadata.get(DELIVERY_PROGRESS)?.get("recipient")?.as_str().map(str::to_string)
}

fn record_marked(exec: &WorkflowExecution) -> bool {
    exec.metadata
        .get(DELIVERY_PROGRESS)
        .and_then(|progress| progress.get("record_marked"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn dependency(step: StepName) -> &'static str {
    step.dependency().unwrap_or_else(|| step.as_str())
}

/// Summary of the collected replies stored on the generation step.
fn aggregate_responses(responses: &[Response]) -> Value {
    let mut responder_ids: Vec<&str> = responses.iter().map(|r| r.recipient_id.as_str()).collect();
    responder_ids.sort_unstable();
    responder_ids.dedup();

    let best = responses
        .iter()
        .filter_map(|r| r.amount.map(|amount| (amount, r)))
        .min_by(|a, b| a.0.total_cmp(&b.0));

    json!({
        "response_count": responses.len(),
        "responder_count": responder_ids.len(),
        "responder_ids": responder_ids,
        "best_amount": best.map(|(amount, _)| amount),
        "best_responder_id": best.map(|(_, r)| r.recipient_id.clone()),
    })
}

/// Context handed to the approver alongside the deliverable.
fn approval_timeline(exec: &WorkflowExecution) -> Value {
    let wait = exec.latest_step(StepName::ResponseWait).map(|step| &step.metadata);
    let generation = exec.latest_step(StepName::Generation).map(|step| &step.metadata);

    json!({
        "workflow_id": exec.id,
        "started_at": exec.started_at,
        "phase_durations_ms": exec.phase_durations_ms,
        "responses": {
            "contacted": exec.responses.contacted,
            "responded": exec.responses.responded,
            "response_rate": exec.responses.response_rate,
        },
        "wait_reason": wait.and_then(|m| m.get("reason")),
        "responder_count": generation.and_then(|m| m.get("responder_count")),
        "best_amount": generation.and_then(|m| m.get("best_amount")),
        "recovery_actions": exec.recovery.attempted.then(|| exec.recovery.actions.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn response(recipient: &str, amount: Option<f64>) -> Response {
        Response {
            id: format!("resp-{recipient}"),
            recipient_id: recipient.to_string(),
            received_at: Utc::now(),
            amount,
            payload: Value::Null,
        }
    }

    #[test]
    fn test_aggregate_picks_lowest_amount() {
        let responses = vec![
            response("acme", Some(120.0)),
            response("globex", Some(95.5)),
            response("acme", None),
        ];
        let summary = aggregate_responses(&responses);
        assert_eq!(summary["response_count"], 3);
        assert_eq!(summary["responder_count"], 2);
        assert_eq!(summary["best_amount"], 95.5);
        assert_eq!(summary["best_responder_id"], "globex");
    }

    #[test]
    fn test_aggregate_without_amounts() {
        let summary = aggregate_responses(&[response("acme", None)]);
        assert!(summary["best_amount"].is_null());
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("edited".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Edited);
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }

    #[test]
    fn test_unguarded_steps_fall_back_to_step_name() {
        assert_eq!(dependency(StepName::Send), "delivery-send");
        assert_eq!(dependency(StepName::Approval), "approval");
    }
}
