//! Integration tests for `procura simulate` and the inspection commands.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn procura() -> Command {
    let mut cmd = Command::cargo_bin("procura").unwrap();
    cmd.env_remove("PROCURA_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn simulate_json(args: &[&str]) -> Value {
    let output = procura().arg("simulate").args(args).output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_simulate_default_delivers() {
    let report = simulate_json(&[]);
    assert_eq!(report["start"]["status"], "pending_approval");
    assert_eq!(report["approval"]["status"], "completed");
    assert_eq!(report["approval"]["outcome"], "delivered");
    assert_eq!(report["execution"]["steps"].as_array().unwrap().len(), 6);
    assert_eq!(report["side_effects"]["record_statuses"][0], "sent");
}

#[test]
fn test_simulate_without_recipients_escalates() {
    let report = simulate_json(&["--recipients", "0"]);
    assert_eq!(report["start"]["success"], false);
    assert_eq!(report["start"]["status"], "failed");
    assert_eq!(report["execution"]["failure"]["reason"], "no_eligible_recipients");
    assert_eq!(report["side_effects"]["escalations"].as_array().unwrap().len(), 1);
    assert!(report["approval"].is_null());
}

#[test]
fn test_simulate_confidence_band_needs_review() {
    let report = simulate_json(&["--confidence", "0.6"]);
    assert_eq!(report["start"]["outcome"], "manual_review");
    assert_eq!(report["start"]["status"], "completed");
}

#[test]
fn test_simulate_rejection_and_pending() {
    let report = simulate_json(&["--decision", "rejected"]);
    assert_eq!(report["approval"]["outcome"], "rejected");

    let report = simulate_json(&["--leave-pending"]);
    assert_eq!(report["start"]["outcome"], "awaiting_approval");
    assert!(report["approval"].is_null());
}

#[test]
fn test_simulate_rejects_unknown_decision() {
    procura()
        .args(["simulate", "--decision", "maybe"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown approval decision"));
}

#[test]
fn test_simulate_multiple_runs() {
    let report = simulate_json(&["--runs", "3", "--window-hours", "12", "--poll-minutes", "30"]);
    let runs = report.as_array().unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| run["approval"]["outcome"] == "delivered"));
}

#[test]
fn test_persisted_run_can_be_inspected() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("procura.db");
    let db = db.to_str().unwrap();

    let report = simulate_json(&["--db", db]);
    let workflow_id = report["start"]["workflow_id"].as_str().unwrap().to_string();

    procura()
        .args(["show", &workflow_id, "--db", db])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"completed\"").and(predicate::str::contains(&workflow_id)));

    procura()
        .args(["health", "--db", db])
        .assert()
        .success()
        .stdout(predicate::str::contains("total_executions"));

    procura()
        .args(["record-outcome", &workflow_id, "--accepted", "true", "--db", db])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"accepted\": true"));

    procura().args(["check-stuck", "--db", db]).assert().success().stdout(predicate::str::contains("\"raised\": 0"));
    procura().args(["trends", "--db", db]).assert().success();
    procura()
        .args(["resolve-alert", &workflow_id, "--db", db])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"resolved\": false"));
}

#[test]
fn test_show_unknown_workflow_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("procura.db");

    procura()
        .args(["show", "does-not-exist", "--db", db.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workflow not found"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("procura.toml");
    std::fs::write(&config, "[orchestrator]\nmin_confidence = 0.9\nauto_proceed_confidence = 0.4\n").unwrap();

    procura().arg("--config").arg(&config).arg("simulate").assert().failure();
}
