//! Idempotency Integration Tests
//!
//! A step's side effect happens at most once, even when its activity is
//! reissued after a restart or called concurrently with the same key.

mod common;

use std::sync::Arc;

use common::{state_label, step, HarnessBuilder};
use sagaflow::adapters::{ActivityExecutor, ActivityOutcome, ActivityRequest};
use sagaflow::core::saga::activity_key;
use sagaflow::core::{EventStore, RunMode};
use sagaflow::domain::{
    ManTaskStatus, Plan, PolicyOutcome, RiskLane, RiskTriageResult, SagaEvent, WorkflowEvent, WorkflowStatus,
};
use uuid::Uuid;

fn green() -> RiskTriageResult {
    RiskTriageResult {
        lane: RiskLane::Green,
        reason: "safe_tool".to_string(),
        risk_factors: Vec::new(),
        requires_approval: false,
        suggested_timeout_hours: 0,
    }
}

fn request(key: &str) -> ActivityRequest {
    ActivityRequest {
        step_id: "charge".to_string(),
        tool: "charge_card".to_string(),
        input: serde_json::json!({"amount": 20}),
        idempotency_key: key.to_string(),
        timeout: None,
    }
}

#[tokio::test]
async fn test_concurrent_duplicate_calls_run_once() {
    let harness = HarnessBuilder::new(vec![step("charge", "charge_card", &[])]).build();
    let layer = Arc::clone(&harness.activities);

    let (first, second) = tokio::join!(
        layer.call_activity(request("wf:charge:charge_card")),
        layer.call_activity(request("wf:charge:charge_card")),
    );

    assert_eq!(first, second);
    assert!(matches!(first, ActivityOutcome::Completed { .. }));
    assert_eq!(harness.calls.count("charge_card"), 1);

    layer.call_activity(request("wf:charge:charge_card:2")).await;
    assert_eq!(harness.calls.count("charge_card"), 2);
}

#[tokio::test]
async fn test_reissued_activity_after_crash_runs_once() {
    let harness = HarnessBuilder::new(vec![step("charge", "charge_card", &[])]).build();
    let orchestrator = harness.orchestrator();
    let workflow_id = orchestrator.submit_goal("charge the card", "alice", "trace-1").await.unwrap();

    // Log the run up to the dispatch, as if the process died mid-activity
    let store = EventStore::open(orchestrator.workflows_dir(), workflow_id).await.unwrap();
    let plan = Plan::generated(Uuid::new_v4(), vec![step("charge", "charge_card", &[])]);
    let events = [
        SagaEvent::PlanResolved { plan },
        SagaEvent::GateEvaluated {
            step_id: "charge".to_string(),
            policy: PolicyOutcome::default_allow(),
            triage: green(),
        },
    ];
    for (offset, event) in events.into_iter().enumerate() {
        store
            .append(&WorkflowEvent::new(workflow_id, 2 + offset as u64, event))
            .await
            .unwrap();
    }

    // The activity had already run before the crash
    let key = activity_key(workflow_id, "charge", "charge_card");
    harness.activities.call_activity(request(&key)).await;
    assert_eq!(harness.calls.count("charge_card"), 1);

    let report = harness
        .orchestrator()
        .resume_workflow(workflow_id, RunMode::UntilFinished)
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(state_label(&report, "charge"), "done");
    assert_eq!(harness.calls.count("charge_card"), 1);
    assert_eq!(report.step("charge").unwrap().result.as_ref().unwrap()["key"], key);
}

#[tokio::test]
async fn test_workflow_cannot_be_driven_twice_at_once() {
    let harness = HarnessBuilder::new(vec![
        step("lookup", "read_record", &[]),
        step("delete", "delete_record", &["lookup"]),
    ])
    .build();
    let orchestrator = harness.orchestrator();

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .run_workflow("delete inactive user 42", "alice", "trace-1", RunMode::UntilFinished)
                .await
        })
    };
    let task_id = harness.wait_for_any_task().await;
    let workflow_id = harness.man_store.get(task_id).unwrap().workflow_id;

    let err = orchestrator
        .resume_workflow(workflow_id, RunMode::UntilIdle)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));

    orchestrator.stop(workflow_id, "test over").await.unwrap();
    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Stopped);

    let task = harness.man_store.get(task_id).unwrap();
    assert_eq!(task.status, ManTaskStatus::Expired);
    assert_eq!(task.decision.unwrap().reason.as_deref(), Some("workflow stopped: test over"));
    assert!(harness.man_store.list_pending().unwrap().is_empty());
}
