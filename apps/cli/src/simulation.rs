//! In-process collaborators for `procura simulate`.
//!
//! Replies arrive on an hourly schedule measured against a manual clock, so
//! the response monitor can wait out a full window without real time passing.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procura_core::clock::elapsed_between;
use procura_core::{
    Artifact, BusinessRecords, Clock, ContactService, DeliverableService, DeliveryReceipt, DeliveryService,
    Detection, DetectionService, ExecutionStore, HumanTask, ManualClock, NotificationSink, RecordStatus, Response,
    ResponseCount, ResponseQuery, ServiceResult, TaskSink,
};
use procura_orchestrator::Collaborators;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

/// Knobs for one simulated workflow.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub is_match: bool,
    pub confidence: f64,
    pub recipients: u32,
    pub responders: u32,
    pub reply_after_hours: u64,
    pub fail_delivery: bool,
}

/// What the simulated collaborators saw, reported next to the execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideEffects {
    pub approval_tasks: Vec<String>,
    pub escalations: Vec<HumanTask>,
    pub record_statuses: Vec<RecordStatus>,
    pub follow_ups: Vec<DateTime<Utc>>,
    pub deliveries: Vec<String>,
    pub notifications: Vec<String>,
}

pub struct SimulatedWorld {
    scenario: Scenario,
    clock: Arc<ManualClock>,
    started_at: DateTime<Utc>,
    effects: Mutex<SideEffects>,
}

impl SimulatedWorld {
    pub fn new(scenario: Scenario, clock: Arc<ManualClock>) -> Self {
        Self { started_at: clock.now(), scenario, clock, effects: Mutex::new(SideEffects::default()) }
    }

    /// Wires the world in as every collaborator, persisting to `store`.
    pub fn collaborators(self: &Arc<Self>, store: Arc<dyn ExecutionStore>) -> Collaborators {
        Collaborators {
            detection: self.clone(),
            contact: self.clone(),
            responses: self.clone(),
            deliverables: self.clone(),
            tasks: self.clone(),
            delivery: self.clone(),
            records: self.clone(),
            notifier: self.clone(),
            store,
        }
    }

    pub fn side_effects(&self) -> SideEffects {
        self.effects().clone()
    }

    fn effects(&self) -> std::sync::MutexGuard<'_, SideEffects> {
        self.effects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Responder `i` replies `reply_after_hours + i` hours after the start.
    fn replies(&self) -> Vec<(u32, f64)> {
        let hours = elapsed_between(self.started_at, self.clock.now()).as_secs() / 3600;
        let responders = self.scenario.responders.min(self.scenario.recipients);
        (0..responders)
            .filter(|i| self.scenario.reply_after_hours + u64::from(*i) <= hours)
            .map(|i| (i, 1000.0 - 75.0 * f64::from(i)))
            .collect()
    }
}

#[async_trait]
impl DetectionService for SimulatedWorld {
    async fn classify(&self, trigger_id: &str) -> ServiceResult<Detection> {
        Ok(Detection {
            is_match: self.scenario.is_match,
            confidence: self.scenario.confidence,
            business_record_id: self.scenario.is_match.then(|| format!("rec-{trigger_id}")),
            extracted_data: json!({ "source": "simulation", "trigger_id": trigger_id }),
        })
    }
}

#[async_trait]
impl ContactService for SimulatedWorld {
    async fn dispatch(&self, business_record_id: &str) -> ServiceResult<u32> {
        info!(business_record_id = %business_record_id, recipients = self.scenario.recipients, "Simulated contact");
        Ok(self.scenario.recipients)
    }

    async fn nudge_non_responders(&self, _business_record_id: &str) -> ServiceResult<u32> {
        Ok(self.scenario.recipients.saturating_sub(self.replies().len() as u32))
    }
}

#[async_trait]
impl ResponseQuery for SimulatedWorld {
    async fn count_responses(&self, _business_record_id: &str) -> ServiceResult<ResponseCount> {
        Ok(ResponseCount { responded: self.replies().len() as u32, contacted: self.scenario.recipients })
    }

    async fn list_responses(&self, business_record_id: &str) -> ServiceResult<Vec<Response>> {
        let now = self.clock.now();
        Ok(self
            .replies()
            .into_iter()
            .map(|(i, amount)| Response {
                id: format!("{business_record_id}-reply-{i}"),
                recipient_id: format!("supplier-{i}"),
                received_at: now,
                amount: Some(amount),
                payload: Value::Null,
            })
            .collect())
    }
}

#[async_trait]
impl DeliverableService for SimulatedWorld {
    async fn generate(&self, business_record_id: &str) -> ServiceResult<Artifact> {
        Ok(Artifact {
            artifact_id: format!("quote-{business_record_id}"),
            artifact_url: format!("file:///tmp/procura/quote-{business_record_id}.pdf"),
        })
    }
}

#[async_trait]
impl TaskSink for SimulatedWorld {
    async fn create_or_update_approval_task(
        &self,
        _business_record_id: &str,
        workflow_id: &str,
        _artifact_url: &str,
        _timeline: &Value,
    ) -> ServiceResult<String> {
        let task_id = format!("approval-{workflow_id}");
        self.effects().approval_tasks.push(task_id.clone());
        Ok(task_id)
    }

    async fn create_task(&self, task: &HumanTask) -> ServiceResult<String> {
        let mut effects = self.effects();
        effects.escalations.push(task.clone());
        Ok(format!("task-{}", effects.escalations.len()))
    }
}

#[async_trait]
impl DeliveryService for SimulatedWorld {
    async fn send(&self, recipient: &str, artifact: &Artifact) -> ServiceResult<DeliveryReceipt> {
        if self.scenario.fail_delivery {
            return Ok(DeliveryReceipt { success: false, error: Some("recipient mailbox rejected message".to_string()) });
        }
        self.effects().deliveries.push(format!("{} -> {recipient}", artifact.artifact_id));
        Ok(DeliveryReceipt { success: true, error: None })
    }
}

#[async_trait]
impl BusinessRecords for SimulatedWorld {
    async fn recipient(&self, business_record_id: &str) -> ServiceResult<String> {
        Ok(format!("customer+{business_record_id}@example.com"))
    }

    async fn mark_status(&self, _business_record_id: &str, status: RecordStatus) -> ServiceResult<()> {
        self.effects().record_statuses.push(status);
        Ok(())
    }

    async fn schedule_follow_up(&self, business_record_id: &str, due_at: DateTime<Utc>) -> ServiceResult<String> {
        self.effects().follow_ups.push(due_at);
        Ok(format!("follow-up-{business_record_id}"))
    }
}

#[async_trait]
impl NotificationSink for SimulatedWorld {
    async fn notify(&self, agent_name: &str, message: &str, _data: &Value) -> ServiceResult<()> {
        info!(agent = %agent_name, "{}", message);
        self.effects().notifications.push(message.to_string());
        Ok(())
    }
}
