//! Event Store Integration Tests
//!
//! Tests for the workflow event log, snapshots and recovery from them.

mod common;

use common::{state_label, step, HarnessBuilder};
use sagaflow::core::{EventStore, RunMode, SagaError};
use sagaflow::domain::{SagaEvent, WorkflowStatus};

#[tokio::test]
async fn test_every_event_is_logged_in_sequence() {
    let harness = HarnessBuilder::new(vec![
        step("fetch", "read_record", &[]),
        step("index", "search", &["fetch"]),
    ])
    .build();
    let orchestrator = harness.orchestrator();

    let report = orchestrator
        .run_workflow("index record 7", "alice", "trace-index-7", RunMode::UntilFinished)
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let store = EventStore::open(orchestrator.workflows_dir(), report.workflow_id)
        .await
        .unwrap();
    let events = store.replay().await.unwrap();

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);

    assert!(matches!(
        events[0].event,
        SagaEvent::Started { ref goal, ref trace_id, .. } if goal == "index record 7" && trace_id == "trace-index-7"
    ));
    assert!(matches!(events[1].event, SagaEvent::PlanResolved { .. }));

    let kinds: Vec<&str> = events.iter().map(|e| e.event.kind()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "gate_evaluated").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "activity_completed").count(), 2);

    // activity results carry their duration
    assert!(events
        .iter()
        .filter(|e| e.event.kind() == "activity_completed")
        .all(|e| e.duration_ms.is_some()));
}

#[tokio::test]
async fn test_status_is_rebuilt_from_log() {
    let harness = HarnessBuilder::new(vec![
        step("lookup", "read_record", &[]),
        step("delete", "delete_record", &["lookup"]),
    ])
    .build();

    let report = harness
        .orchestrator()
        .run_workflow("delete inactive user 42", "alice", "trace-1", RunMode::UntilIdle)
        .await
        .unwrap();

    // a fresh runner sees the same state
    let status = harness.orchestrator().workflow_status(report.workflow_id).await.unwrap();
    assert_eq!(status, report);

    let listed = harness.orchestrator().list_workflows().await.unwrap();
    assert_eq!(listed, vec![report.workflow_id]);
}

#[tokio::test]
async fn test_snapshot_then_resume() {
    let harness = HarnessBuilder::new(vec![
        step("lookup", "read_record", &[]),
        step("index", "search", &["lookup"]),
        step("delete", "delete_record", &["index"]),
    ])
    .history_threshold(4)
    .build();

    let report = harness
        .orchestrator()
        .run_workflow("delete inactive user 42", "alice", "trace-1", RunMode::UntilIdle)
        .await
        .unwrap();
    let workflow_id = report.workflow_id;

    let store = EventStore::open(&harness.temp.path().join("workflows"), workflow_id)
        .await
        .unwrap();
    let snapshot = store.load_snapshot().await.unwrap().expect("snapshot written");
    assert!(snapshot.last_sequence > 0);
    assert!(snapshot.last_sequence <= store.last_sequence().await.unwrap());

    let task_id = report.step("delete").unwrap().man_task_id.unwrap();
    harness.orchestrator().approve(task_id, "bob").unwrap();

    let report = harness
        .orchestrator()
        .resume_workflow(workflow_id, RunMode::UntilFinished)
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(state_label(&report, "delete"), "done");
    assert_eq!(harness.calls.count("read_record"), 1);
}

#[tokio::test]
async fn test_tampered_snapshot_is_reported_as_corruption() {
    let harness = HarnessBuilder::new(vec![
        step("lookup", "read_record", &[]),
        step("index", "search", &["lookup"]),
        step("delete", "delete_record", &["index"]),
    ])
    .history_threshold(4)
    .build();
    let orchestrator = harness.orchestrator();

    let report = orchestrator
        .run_workflow("delete inactive user 42", "alice", "trace-1", RunMode::UntilIdle)
        .await
        .unwrap();

    let snapshot_path = harness
        .temp
        .path()
        .join("workflows")
        .join(report.workflow_id.to_string())
        .join("snapshot.json");
    let content = std::fs::read_to_string(&snapshot_path).unwrap();
    std::fs::write(&snapshot_path, content.replace("delete inactive user 42", "delete every user")).unwrap();

    let err = orchestrator
        .resume_workflow(report.workflow_id, RunMode::UntilFinished)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SagaError>(),
        Some(SagaError::SnapshotCorruption { .. })
    ));
}

#[tokio::test]
async fn test_log_stays_bounded_across_checkpoints() {
    let steps: Vec<_> = (1..=8)
        .map(|i| {
            let id = format!("read{}", i);
            let dep = format!("read{}", i - 1);
            let deps: Vec<&str> = if i == 1 { Vec::new() } else { vec![dep.as_str()] };
            step(&id, "read_record", &deps)
        })
        .collect();
    let harness = HarnessBuilder::new(steps).history_threshold(4).build();
    let orchestrator = harness.orchestrator();

    let report = orchestrator
        .run_workflow("read records 1 to 8", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(harness.calls.count("read_record"), 8);

    let store = EventStore::open(orchestrator.workflows_dir(), report.workflow_id)
        .await
        .unwrap();
    let snapshot = store.load_snapshot().await.unwrap().expect("snapshot written");
    let events = store.replay().await.unwrap();

    // Only the tail after the last checkpoint is left on disk
    assert!(events.len() <= 5, "log kept {} events", events.len());
    assert!(events.iter().all(|e| e.sequence > snapshot.last_sequence));
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (snapshot.last_sequence + 1..=snapshot.last_sequence + events.len() as u64).collect();
    assert_eq!(sequences, expected);
    // 1 start + 1 plan + 8 gates + 8 completions
    assert_eq!(store.last_sequence().await.unwrap(), 18);

    // The compacted log still rebuilds the same workflow
    let status = harness.orchestrator().workflow_status(report.workflow_id).await.unwrap();
    assert_eq!(status, report);
}
