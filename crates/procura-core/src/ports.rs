//! Narrow interfaces to the engine's external collaborators.
//!
//! Content generation, business-record persistence, messaging and delivery
//! are owned by the implementations of these traits. The engine only sees
//! the shapes below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::ServiceError;

/// Result type for collaborator calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Output of trigger classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Whether the trigger is a request this workflow handles.
    pub is_match: bool,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    /// Business record created for a positive match.
    pub business_record_id: Option<String>,
    /// Structured data extracted from the trigger.
    #[serde(default)]
    pub extracted_data: Value,
}

/// Classifies inbound triggers.
#[async_trait]
pub trait DetectionService: Send + Sync {
    async fn classify(&self, trigger_id: &str) -> ServiceResult<Detection>;
}

/// Contacts third parties about a business record.
#[async_trait]
pub trait ContactService: Send + Sync {
    /// Notifies every eligible recipient and returns how many were contacted.
    async fn dispatch(&self, business_record_id: &str) -> ServiceResult<u32>;

    /// Sends a reminder to recipients who have not replied yet.
    async fn nudge_non_responders(&self, business_record_id: &str) -> ServiceResult<u32>;
}

/// Response counts for a business record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseCount {
    pub responded: u32,
    pub contacted: u32,
}

/// A reply from a contacted third party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub recipient_id: String,
    pub received_at: DateTime<Utc>,
    /// Quoted amount, when the reply carries one.
    pub amount: Option<f64>,
    #[serde(default)]
    pub payload: Value,
}

/// Read access to collected replies.
#[async_trait]
pub trait ResponseQuery: Send + Sync {
    async fn count_responses(&self, business_record_id: &str) -> ServiceResult<ResponseCount>;

    async fn list_responses(&self, business_record_id: &str) -> ServiceResult<Vec<Response>>;
}

/// Generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_url: String,
}

/// Builds the deliverable from the collected replies.
#[async_trait]
pub trait DeliverableService: Send + Sync {
    async fn generate(&self, business_record_id: &str) -> ServiceResult<Artifact>;
}

/// Priority of a human task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Normal,
    High,
    Urgent,
}

/// Human-actionable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub owner: String,
    pub business_record_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Sink for approval and escalation tasks.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Creates the approval task for a record, or updates the existing one.
    async fn create_or_update_approval_task(
        &self,
        business_record_id: &str,
        workflow_id: &str,
        artifact_url: &str,
        timeline: &Value,
    ) -> ServiceResult<String>;

    /// Creates a free-standing human task and returns its id.
    async fn create_task(&self, task: &HumanTask) -> ServiceResult<String>;
}

/// Outcome reported by the delivery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub success: bool,
    pub error: Option<String>,
}

/// Delivers an artifact to its recipient.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(&self, recipient: &str, artifact: &Artifact) -> ServiceResult<DeliveryReceipt>;
}

/// Lifecycle status of the business record the workflow operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Sent,
    Rejected,
}

/// Minimal access to the business record.
#[async_trait]
pub trait BusinessRecords: Send + Sync {
    /// Address the deliverable goes to.
    async fn recipient(&self, business_record_id: &str) -> ServiceResult<String>;

    async fn mark_status(&self, business_record_id: &str, status: RecordStatus) -> ServiceResult<()>;

    /// Schedules a follow-up and returns its id.
    async fn schedule_follow_up(
        &self,
        business_record_id: &str,
        due_at: DateTime<Utc>,
    ) -> ServiceResult<String>;
}

/// Human-readable status and alert fan-out.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, agent_name: &str, message: &str, data: &Value) -> ServiceResult<()>;
}

/// Notification sink that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, agent_name: &str, message: &str, data: &Value) -> ServiceResult<()> {
        info!(agent = %agent_name, data = %data, "{}", message);
        Ok(())
    }
}
