//! Stuck-execution and trend alerts.

use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use procura_core::clock::{elapsed_between, to_chrono};
use procura_core::{AlertContext, AlertType, ExecutionFilter, ExecutionStatus, Severity, WorkflowExecution};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::Telemetry;
use crate::error::Result;

/// An alert raised by the telemetry engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    /// Execution the alert is about; `None` for system-level alerts.
    pub workflow_id: Option<String>,
    pub details: Value,
    pub raised_at: DateTime<Utc>,
}

/// Aggregate rates over a set of recent executions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub total: usize,
    pub failed: usize,
    pub completed: usize,
    /// Executions that contacted at least one recipient.
    pub response_sample: usize,
    /// Responded over contacted, summed across the sample.
    pub response_rate: Option<f64>,
    /// Executions with a known downstream acceptance.
    pub acceptance_sample: usize,
    pub acceptance_rate: Option<f64>,
}

impl TrendSnapshot {
    pub fn from_executions(executions: &[WorkflowExecution]) -> Self {
        let mut snapshot = Self { total: executions.len(), ..Self::default() };
        let (mut contacted, mut responded, mut accepted) = (0_u64, 0_u64, 0_usize);

        for exec in executions {
            match exec.status {
                ExecutionStatus::Failed => snapshot.failed += 1,
                ExecutionStatus::Completed => snapshot.completed += 1,
                _ => {}
            }
            if exec.responses.contacted > 0 {
                snapshot.response_sample += 1;
                contacted += u64::from(exec.responses.contacted);
                responded += u64::from(exec.responses.responded);
            }
            if let Some(was_accepted) = exec.deliverable_accepted {
                snapshot.acceptance_sample += 1;
                accepted += usize::from(was_accepted);
            }
        }

        snapshot.response_rate = (contacted > 0).then(|| responded as f64 / contacted as f64);
        snapshot.acceptance_rate =
            (snapshot.acceptance_sample > 0).then(|| accepted as f64 / snapshot.acceptance_sample as f64);
        snapshot
    }

    pub fn failure_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.failed as f64 / self.total as f64)
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.completed as f64 / self.total as f64)
    }
}

impl Telemetry {
    /// Flags active executions that made no progress within the stuck
    /// threshold. Each execution alerts once until its alert is resolved.
    pub async fn check_stuck_workflows(&self) -> Result<Vec<Alert>> {
        let now = self.now();
        let cutoff = now - to_chrono(self.settings.stuck_after());
        let candidates = self
            .store
            .list_executions(&ExecutionFilter::all().with_statuses(ExecutionStatus::ACTIVE))
            .await?;

        let mut alerts = Vec::new();
        for mut exec in candidates {
            if exec.alert.raised || exec.updated_at >= cutoff {
                continue;
            }

            let previous = exec.status;
            let idle = elapsed_between(exec.updated_at, now);
            let step = exec.in_progress_step().map(|step| step.name.as_str());
            let alert = Alert {
                alert_type: AlertType::Stuck,
                severity: Severity::High,
                message: format!(
                    "Workflow {} has made no progress for {}h in status {}",
                    exec.id,
                    idle.as_secs() / 3600,
                    previous
                ),
                workflow_id: Some(exec.id.clone()),
                details: json!({
                    "status": previous,
                    "step": step,
                    "business_record_id": exec.business_record_id,
                    "started_at": exec.started_at,
                    "last_progress_at": exec.updated_at,
                }),
                raised_at: now,
            };

            exec.transition_to(ExecutionStatus::Stuck)?;
            exec.alert = AlertContext { raised: true, alert_type: Some(AlertType::Stuck), raised_at: Some(now) };
            exec.updated_at = now;
            self.store.upsert_execution(&exec).await?;

            warn!(workflow_id = %exec.id, status = %previous, "Workflow flagged stuck");
            self.notify(&alert.message, &alert.details).await;
            alerts.push(alert);
        }
        Ok(alerts)
    }

    /// Checks response, acceptance and failure trends over the rolling
    /// window. A system-level alert fires once while its condition holds and
    /// clears when the condition no longer does.
    pub async fn monitor_response_rate_trends(&self) -> Result<Vec<Alert>> {
        let now = self.now();
        let since = now - to_chrono(self.settings.trend_window());
        let recent = self.store.list_executions(&ExecutionFilter::all().started_after(since)).await?;
        let snapshot = TrendSnapshot::from_executions(&recent);
        let min_sample = self.settings.min_sample;

        let response_low = snapshot.response_sample >= min_sample
            && snapshot.response_rate.is_some_and(|rate| rate < self.settings.response_rate_floor);
        let acceptance_low = snapshot.acceptance_sample >= min_sample
            && snapshot.acceptance_rate.is_some_and(|rate| rate < self.settings.acceptance_floor);
        let failures_high = snapshot.total >= min_sample
            && snapshot.failure_rate().is_some_and(|rate| rate > self.settings.failure_rate_ceiling);

        let conditions = [
            (AlertType::RecipientNonResponse, response_low),
            (AlertType::DecliningAcceptance, acceptance_low),
            (AlertType::HighFailureRate, failures_high),
        ];

        let mut raised = Vec::new();
        {
            let mut active = self.system_alerts.lock().unwrap_or_else(PoisonError::into_inner);
            for (alert_type, holds) in conditions {
                if holds {
                    if !active.contains_key(&alert_type) {
                        active.insert(alert_type, now);
                        raised.push(self.trend_alert(alert_type, &snapshot, now));
                    }
                } else if active.remove(&alert_type).is_some() {
                    info!(alert_type = alert_type.as_str(), "Trend alert cleared");
                }
            }
        }

        for alert in &raised {
            warn!(alert_type = alert.alert_type.as_str(), "{}", alert.message);
            self.notify(&alert.message, &alert.details).await;
        }
        Ok(raised)
    }

    /// System-level alerts currently active.
    pub fn active_system_alerts(&self) -> Vec<(AlertType, DateTime<Utc>)> {
        let active = self.system_alerts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut alerts: Vec<_> = active.iter().map(|(alert_type, at)| (*alert_type, *at)).collect();
        alerts.sort_by_key(|(_, at)| *at);
        alerts
    }

    fn trend_alert(&self, alert_type: AlertType, snapshot: &TrendSnapshot, now: DateTime<Utc>) -> Alert {
        let window_days = self.settings.trend_window_days;
        let (severity, message) = match alert_type {
            AlertType::RecipientNonResponse => (
                Severity::High,
                format!(
                    "Recipient response rate {:.0}% over the last {window_days} days is below {:.0}%",
                    snapshot.response_rate.unwrap_or_default() * 100.0,
                    self.settings.response_rate_floor * 100.0
                ),
            ),
            AlertType::DecliningAcceptance => (
                Severity::Medium,
                format!(
                    "Deliverable acceptance {:.0}% over the last {window_days} days is below {:.0}%",
                    snapshot.acceptance_rate.unwrap_or_default() * 100.0,
                    self.settings.acceptance_floor * 100.0
                ),
            ),
            AlertType::HighFailureRate | AlertType::Stuck => (
                Severity::Critical,
                format!(
                    "{} of {} workflows failed over the last {window_days} days (ceiling {:.0}%)",
                    snapshot.failed,
                    snapshot.total,
                    self.settings.failure_rate_ceiling * 100.0
                ),
            ),
        };
        Alert {
            alert_type,
            severity,
            message,
            workflow_id: None,
            details: json!({ "window_days": window_days, "snapshot": snapshot }),
            raised_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use procura_core::{
        Clock, ExecutionStore, InMemoryExecutionStore, ManualClock, TelemetrySettings, TracingNotifier,
    };

    fn setup() -> (Telemetry, Arc<ManualClock>, Arc<InMemoryExecutionStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryExecutionStore::new());
        let telemetry = Telemetry::new(
            TelemetrySettings::default(),
            "procura",
            store.clone(),
            Arc::new(TracingNotifier),
            clock.clone(),
        );
        (telemetry, clock, store)
    }

    fn execution(id: &str, status: ExecutionStatus, at: DateTime<Utc>) -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(id, None, at);
        exec.status = status;
        exec
    }

    #[tokio::test]
    async fn test_stuck_alert_raised_once() {
        let (telemetry, clock, store) = setup();
        let start = clock.now();
        store
            .upsert_execution(&execution("wf-stuck", ExecutionStatus::Contacted, start))
            .await
            .unwrap();
        store
            .upsert_execution(&execution("wf-waiting", ExecutionStatus::PendingApproval, start))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(25 * 3600));
        let alerts = telemetry.check_stuck_workflows().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].workflow_id.as_deref(), Some("wf-stuck"));

        let stored = store.get_execution("wf-stuck").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Stuck);
        assert!(stored.alert.raised);

        clock.advance(Duration::from_secs(25 * 3600));
        assert!(telemetry.check_stuck_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_send_is_flagged_stuck() {
        let (telemetry, clock, store) = setup();
        store.upsert_execution(&execution("wf-sending", ExecutionStatus::Sent, clock.now())).await.unwrap();

        clock.advance(Duration::from_secs(72 * 3600));
        let alerts = telemetry.check_stuck_workflows().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].details["status"], "sent");

        let stored = store.get_execution("wf-sending").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Stuck);
    }

    #[tokio::test]
    async fn test_recent_progress_is_not_stuck() {
        let (telemetry, clock, store) = setup();
        let mut exec = execution("wf-1", ExecutionStatus::AwaitingResponses, clock.now());
        clock.advance(Duration::from_secs(30 * 3600));
        exec.updated_at = clock.now();
        store.upsert_execution(&exec).await.unwrap();

        assert!(telemetry.check_stuck_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_rate_alert_is_idempotent_and_clears() {
        let (telemetry, clock, store) = setup();
        let now = clock.now();
        store.upsert_execution(&execution("a", ExecutionStatus::Failed, now)).await.unwrap();
        store.upsert_execution(&execution("b", ExecutionStatus::Failed, now)).await.unwrap();
        store.upsert_execution(&execution("c", ExecutionStatus::Completed, now)).await.unwrap();

        let alerts = telemetry.monitor_response_rate_trends().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighFailureRate);
        assert!(telemetry.monitor_response_rate_trends().await.unwrap().is_empty());

        for id in ["d", "e", "f", "g", "h", "i"] {
            store.upsert_execution(&execution(id, ExecutionStatus::Completed, now)).await.unwrap();
        }
        assert!(telemetry.monitor_response_rate_trends().await.unwrap().is_empty());
        assert!(telemetry.active_system_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_low_response_rate_alert() {
        let (telemetry, clock, store) = setup();
        for n in 0..3 {
            let mut exec = execution(&format!("wf-{n}"), ExecutionStatus::Completed, clock.now());
            exec.responses.contacted = 4;
            exec.responses.responded = 1;
            store.upsert_execution(&exec).await.unwrap();
        }

        let alerts = telemetry.monitor_response_rate_trends().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::RecipientNonResponse);
    }

    #[tokio::test]
    async fn test_declining_acceptance_alert() {
        let (telemetry, clock, store) = setup();
        for (n, accepted) in [false, false, true, false].into_iter().enumerate() {
            let mut exec = execution(&format!("wf-{n}"), ExecutionStatus::Completed, clock.now());
            exec.deliverable_accepted = Some(accepted);
            store.upsert_execution(&exec).await.unwrap();
        }

        let alerts = telemetry.monitor_response_rate_trends().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DecliningAcceptance);
    }

    #[tokio::test]
    async fn test_small_sample_does_not_alert() {
        let (telemetry, clock, store) = setup();
        store.upsert_execution(&execution("a", ExecutionStatus::Failed, clock.now())).await.unwrap();
        assert!(telemetry.monitor_response_rate_trends().await.unwrap().is_empty());
    }
}
