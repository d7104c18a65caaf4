//! Health summary over recent executions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use procura_core::clock::to_chrono;
use procura_core::{
    AlertType, DiagnosticCategory, ExecutionFilter, ExecutionStatus, FailureReason, Severity, StepName,
    WorkflowExecution,
};
use serde::{Deserialize, Serialize};

use super::{Telemetry, TrendSnapshot};
use crate::error::Result;

const RECENT_FAILURE_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_executions: usize,
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_response_rate: Option<f64>,
    pub acceptance_rate: Option<f64>,
    /// Mean time spent per phase across executions that ran it.
    pub average_phase_duration_ms: BTreeMap<StepName, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckReport {
    pub workflow_id: String,
    pub step: Option<StepName>,
    pub duration_ms: Option<u64>,
    pub overage_ms: Option<u64>,
    pub detected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub workflow_id: String,
    pub business_record_id: Option<String>,
    pub reason: Option<FailureReason>,
    pub step: Option<StepName>,
    pub category: Option<DiagnosticCategory>,
    pub severity: Option<Severity>,
    pub error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertReport {
    /// `None` for system-level alerts.
    pub workflow_id: Option<String>,
    pub alert_type: AlertType,
    pub raised_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`Telemetry::get_health_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    pub window_days: u32,
    pub metrics: HealthMetrics,
    pub bottlenecks: Vec<BottleneckReport>,
    pub failures: Vec<FailureReport>,
    pub alerts: Vec<AlertReport>,
}

impl Telemetry {
    /// Summarizes executions started within the trend window.
    pub async fn get_health_summary(&self) -> Result<HealthSummary> {
        let now = self.now();
        let since = now - to_chrono(self.settings.trend_window());
        let executions = self.store.list_executions(&ExecutionFilter::all().started_after(since)).await?;

        let mut alerts: Vec<AlertReport> = executions
            .iter()
            .filter(|exec| exec.alert.raised)
            .filter_map(|exec| {
                exec.alert.alert_type.map(|alert_type| AlertReport {
                    workflow_id: Some(exec.id.clone()),
                    alert_type,
                    raised_at: exec.alert.raised_at,
                })
            })
            .collect();
        alerts.extend(self.active_system_alerts().into_iter().map(|(alert_type, at)| AlertReport {
            workflow_id: None,
            alert_type,
            raised_at: Some(at),
        }));

        Ok(HealthSummary {
            generated_at: now,
            window_days: self.settings.trend_window_days,
            metrics: metrics(&executions),
            bottlenecks: bottlenecks(&executions),
            failures: recent_failures(&executions),
            alerts,
        })
    }
}

fn metrics(executions: &[WorkflowExecution]) -> HealthMetrics {
    let snapshot = TrendSnapshot::from_executions(executions);

    let mut by_status = BTreeMap::new();
    for exec in executions {
        *by_status.entry(exec.status).or_insert(0) += 1;
    }

    let mut phase_totals: BTreeMap<StepName, (u64, u64)> = BTreeMap::new();
    for exec in executions {
        for (step, ms) in &exec.phase_durations_ms {
            let entry = phase_totals.entry(*step).or_insert((0, 0));
            entry.0 += ms;
            entry.1 += 1;
        }
    }
    let average_phase_duration_ms =
        phase_totals.into_iter().map(|(step, (total, count))| (step, total / count.max(1))).collect();

    HealthMetrics {
        total_executions: snapshot.total,
        by_status,
        success_rate: snapshot.success_rate().unwrap_or_default(),
        failure_rate: snapshot.failure_rate().unwrap_or_default(),
        average_response_rate: snapshot.response_rate,
        acceptance_rate: snapshot.acceptance_rate,
        average_phase_duration_ms,
    }
}

fn bottlenecks(executions: &[WorkflowExecution]) -> Vec<BottleneckReport> {
    executions
        .iter()
        .filter(|exec| exec.bottleneck.detected)
        .map(|exec| BottleneckReport {
            workflow_id: exec.id.clone(),
            step: exec.bottleneck.step,
            duration_ms: exec.bottleneck.duration_ms,
            overage_ms: exec.bottleneck.overage_ms,
            detected_at: exec.bottleneck.detected_at,
        })
        .collect()
}

fn recent_failures(executions: &[WorkflowExecution]) -> Vec<FailureReport> {
    let mut failed: Vec<&WorkflowExecution> =
        executions.iter().filter(|exec| exec.status == ExecutionStatus::Failed).collect();
    failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

    failed
        .into_iter()
        .take(RECENT_FAILURE_LIMIT)
        .map(|exec| {
            let diagnosis = exec.diagnostics.diagnosis.as_ref();
            FailureReport {
                workflow_id: exec.id.clone(),
                business_record_id: exec.business_record_id.clone(),
                reason: exec.failure.reason,
                step: exec.failure.step,
                category: diagnosis.map(|d| d.category),
                severity: diagnosis.map(|d| d.severity),
                error: exec.failure.error_history.last().map(|entry| entry.message.clone()),
                failed_at: exec.completed_at,
            }
        })
        .collect()
}
