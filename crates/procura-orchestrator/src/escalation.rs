//! Hands failures the engine cannot resolve to a human operator.

use std::sync::Arc;

use procura_core::{FailureReason, HumanTask, NotificationSink, TaskPriority, TaskSink};
use serde_json::json;
use tracing::{error, info, warn};

/// Creates urgent human tasks for unrecoverable failures.
pub struct Escalator {
    tasks: Arc<dyn TaskSink>,
    notifier: Arc<dyn NotificationSink>,
    owner: String,
    agent_name: String,
}

impl std::fmt::Debug for Escalator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Escalator").field("owner", &self.owner).finish_non_exhaustive()
    }
}

impl Escalator {
    pub fn new(
        tasks: Arc<dyn TaskSink>,
        notifier: Arc<dyn NotificationSink>,
        owner: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self { tasks, notifier, owner: owner.into(), agent_name: agent_name.into() }
    }

    /// Escalates a failed business record.
    ///
    /// Never fails: sink errors are logged and swallowed so the caller's
    /// failure handling always completes. Returns the created task id.
    pub async fn escalate(&self, business_record_id: &str, reason: FailureReason, error_text: &str) -> Option<String> {
        let task = HumanTask {
            title: format!("Workflow escalation: {}", reason.description()),
            description: format!(
                "Automated processing of business record {business_record_id} stopped: {}. Error: {error_text}",
                reason.description()
            ),
            priority: TaskPriority::Urgent,
            owner: self.owner.clone(),
            business_record_id: business_record_id.to_string(),
            data: json!({
                "reason": reason.code(),
                "error": error_text,
                "business_record_id": business_record_id,
            }),
        };

        let task_id = match self.tasks.create_task(&task).await {
            Ok(task_id) => {
                info!(
                    business_record_id = %business_record_id,
                    reason = reason.code(),
                    task_id = %task_id,
                    "Escalated to human operator"
                );
                Some(task_id)
            }
            Err(err) => {
                error!(
                    business_record_id = %business_record_id,
                    reason = reason.code(),
                    error = %err,
                    "Escalation task could not be created"
                );
                None
            }
        };

        let message = format!("Escalation for {business_record_id}: {}", reason.description());
        if let Err(err) = self.notifier.notify(&self.agent_name, &message, &task.data).await {
            warn!(business_record_id = %business_record_id, error = %err, "Escalation notification failed");
        }

        task_id
    }
}
