//! Simulate command implementation.
//!
//! Runs complete workflows against in-process collaborators and prints the
//! resulting execution records.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use procura_core::{EngineConfig, ExecutionStatus, ExecutionStore, ManualClock, WorkflowExecution};
use procura_orchestrator::{ApprovalDecision, ApprovalResult, StartResult, WorkflowOrchestrator};
use serde::Serialize;
use tracing::info;

use super::print_json;
use crate::simulation::{Scenario, SideEffects, SimulatedWorld};
use crate::store;

/// Run-level options that do not shape the simulated collaborators.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Decision applied once the workflow waits on approval; `None` leaves it pending.
    pub decision: Option<ApprovalDecision>,
    pub window_hours: Option<u64>,
    pub poll_minutes: Option<u64>,
    pub runs: usize,
    pub db: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    start: StartResult,
    approval: Option<ApprovalResult>,
    execution: Option<WorkflowExecution>,
    side_effects: SideEffects,
}

/// Execute the simulate command.
pub async fn execute(mut config: EngineConfig, scenario: Scenario, options: SimulateOptions) -> anyhow::Result<()> {
    if let Some(hours) = options.window_hours {
        config.monitor.response_window_secs = hours * 3600;
    }
    if let Some(minutes) = options.poll_minutes {
        config.monitor.poll_interval_secs = minutes * 60;
    }
    config.validate()?;

    let store = store::for_simulation(&config, options.db.clone())?;
    let runs = options.runs.max(1);
    info!(runs, confidence = scenario.confidence, recipients = scenario.recipients, "Starting simulation");

    let reports = join_all(
        (0..runs).map(|run| run_one(&config, &scenario, options.decision, store.clone(), run)),
    )
    .await
    .into_iter()
    .collect::<anyhow::Result<Vec<_>>>()?;

    match reports.as_slice() {
        [single] => print_json(single),
        many => print_json(&many),
    }
}

async fn run_one(
    config: &EngineConfig,
    scenario: &Scenario,
    decision: Option<ApprovalDecision>,
    store: Arc<dyn ExecutionStore>,
    run: usize,
) -> anyhow::Result<RunReport> {
    let clock = Arc::new(ManualClock::starting_now());
    let world = Arc::new(SimulatedWorld::new(scenario.clone(), clock.clone()));
    let orchestrator = WorkflowOrchestrator::new(config.clone(), world.collaborators(store.clone()), clock);

    let trigger_id = format!("sim-{}-{run}", Utc::now().format("%Y%m%d%H%M%S%6f"));
    let start = orchestrator.start(&trigger_id).await;

    let approval = match (decision, start.status, start.business_record_id.as_deref()) {
        (Some(decision), ExecutionStatus::PendingApproval, Some(record)) => {
            Some(orchestrator.resolve_approval(record, &start.workflow_id, decision).await)
        }
        _ => None,
    };

    let execution = store.get_execution(&start.workflow_id).await?;
    Ok(RunReport { start, approval, execution, side_effects: world.side_effects() })
}
