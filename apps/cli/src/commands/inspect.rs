//! Telemetry inspection commands: health, stuck sweep, trends, show,
//! acceptance feedback and alert resolution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use procura_core::{EngineConfig, SystemClock, TracingNotifier};
use procura_orchestrator::Telemetry;
use serde_json::json;

use super::print_json;
use crate::store;

fn telemetry(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<Telemetry> {
    let store = store::for_inspection(config, db)?;
    Ok(Telemetry::new(
        config.telemetry.clone(),
        config.orchestrator.agent_name.clone(),
        store,
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
    ))
}

/// Execute the health command.
pub async fn health(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<()> {
    let summary = telemetry(config, db)?.get_health_summary().await?;
    print_json(&summary)
}

/// Execute the check-stuck command.
pub async fn check_stuck(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<()> {
    let alerts = telemetry(config, db)?.check_stuck_workflows().await?;
    print_json(&json!({ "raised": alerts.len(), "alerts": alerts }))
}

/// Execute the trends command.
pub async fn trends(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<()> {
    let telemetry = telemetry(config, db)?;
    let alerts = telemetry.monitor_response_rate_trends().await?;
    print_json(&json!({ "raised": alerts.len(), "alerts": alerts }))
}

/// Execute the show command.
pub async fn show(config: &EngineConfig, db: Option<PathBuf>, workflow_id: &str) -> anyhow::Result<()> {
    let store = store::for_inspection(config, db)?;
    let exec = store
        .get_execution(workflow_id)
        .await?
        .ok_or_else(|| anyhow!("workflow not found: {workflow_id}"))?;
    print_json(&exec)
}

/// Execute the record-outcome command.
pub async fn record_outcome(
    config: &EngineConfig,
    db: Option<PathBuf>,
    workflow_id: &str,
    accepted: bool,
) -> anyhow::Result<()> {
    telemetry(config, db)?.record_deliverable_outcome(workflow_id, accepted).await?;
    print_json(&json!({ "workflow_id": workflow_id, "accepted": accepted }))
}

/// Execute the resolve-alert command.
pub async fn resolve_alert(config: &EngineConfig, db: Option<PathBuf>, workflow_id: &str) -> anyhow::Result<()> {
    let resolved = telemetry(config, db)?.resolve_alert(workflow_id).await?;
    print_json(&json!({ "workflow_id": workflow_id, "resolved": resolved }))
}
