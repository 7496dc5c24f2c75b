//! End-to-end runs through the orchestrator: pools, dispatch, ingestion.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{config_json, invocation, TargetBuilder, TestHarness};
use surfwatch::config::load_config_from_str;
use surfwatch::db::asset_repo;
use surfwatch::{JobStatus, Orchestrator, ScanSchedule};

const TOOLS: &str = r#"[
    {"id":"hosts","name":"Hosts","command":"printf 'www.%s\\napi.%s\\n' {{targets}} {{targets}}","output":"lines"},
    {"id":"hang","name":"Hang","command":"sleep 5","timeout_seconds":1}
]"#;

fn build(harness: &TestHarness) -> Orchestrator {
    let config = load_config_from_str(&config_json(TOOLS, &["hosts"])).unwrap();
    Orchestrator::with_database(config, harness.connect()).unwrap()
}

fn start(harness: &TestHarness) -> Orchestrator {
    let mut orchestrator = build(harness);
    orchestrator.start().unwrap();
    orchestrator
}

#[test]
fn test_tool_run_discovers_assets() {
    let harness = TestHarness::new();
    harness.add_target(&TargetBuilder::new("t1", "example.com").build());
    let orchestrator = start(&harness);

    let id = orchestrator
        .submit_tool_run(invocation("hosts", &["t1"], &[]))
        .unwrap();
    let job = harness.wait_terminal(orchestrator.queue(), &id, Duration::from_secs(15));
    orchestrator.shutdown();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let assets = harness
        .db
        .with_conn(|conn| asset_repo::list_assets(conn, "t1"))
        .unwrap();
    let values: Vec<&str> = assets.iter().map(|a| a.value.as_str()).collect();
    assert_eq!(values, vec!["api.example.com", "www.example.com"]);
}

#[test]
fn test_timed_out_tool_fails_after_retries() {
    let harness = TestHarness::new();
    harness.add_target(&TargetBuilder::new("t1", "example.com").build());
    let orchestrator = start(&harness);

    let id = orchestrator
        .submit_tool_run(invocation("hang", &["t1"], &[]))
        .unwrap();
    let job = harness.wait_terminal(orchestrator.queue(), &id, Duration::from_secs(20));
    orchestrator.shutdown();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.error.unwrap().contains("timed out"));
}

#[test]
fn test_requested_rescan_updates_target() {
    let harness = TestHarness::new();
    harness.add_target(
        &TargetBuilder::new("t1", "example.com")
            .schedule(ScanSchedule::Disabled)
            .last_discovered_at("2026-01-01T00:00:00.000000Z")
            .build(),
    );
    let mut orchestrator = build(&harness);

    let id = orchestrator.request_rescan("t1").unwrap().unwrap();
    // Second request while the first is in flight is refused.
    assert!(orchestrator.request_rescan("t1").unwrap().is_none());
    assert!(harness.target("t1").is_rescan);

    orchestrator.start().unwrap();

    let job = harness.wait_terminal(orchestrator.queue(), &id, Duration::from_secs(15));
    orchestrator.shutdown();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let target = harness.target("t1");
    assert!(!target.is_rescan);
    assert_ne!(
        target.last_discovered_at.as_deref(),
        Some("2026-01-01T00:00:00.000000Z")
    );
    let assets = harness
        .db
        .with_conn(|conn| asset_repo::list_assets(conn, "t1"))
        .unwrap();
    assert_eq!(assets.len(), 2);
}
