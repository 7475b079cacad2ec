//! Semantic plan cache through the orchestrator.

mod common;

use chrono::Duration;
use common::HarnessBuilder;
use sagaflow::core::RunMode;
use sagaflow::domain::{PlanStep, WorkflowStatus};
use serde_json::json;

fn flight_plan() -> Vec<PlanStep> {
    vec![
        PlanStep::new("find", "search_flights", json!({"destination": "Paris", "date": "tomorrow"})),
        PlanStep::new("book", "book_flight", json!({"note": "trip to Paris"}))
            .depends_on(["find"])
            .with_compensation("cancel_booking"),
    ]
}

#[tokio::test]
async fn test_similar_goal_reuses_plan_with_new_entities() {
    let harness = HarnessBuilder::new(flight_plan()).plan_cache().build();
    let orchestrator = harness.orchestrator();

    let first = orchestrator
        .run_workflow("Book a flight to Paris tomorrow", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Completed);
    assert!(!first.cache_hit);
    assert_eq!(harness.planner.calls(), 1);

    let second = orchestrator
        .run_workflow("Book a flight to Tokyo tomorrow", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();
    assert_eq!(second.status, WorkflowStatus::Completed);
    assert!(second.cache_hit);
    assert_eq!(harness.planner.calls(), 1);

    let booked = second.step("book").unwrap().result.as_ref().unwrap();
    assert_eq!(booked["input"]["note"], "trip to Tokyo");
    let found = second.step("find").unwrap().result.as_ref().unwrap();
    assert_eq!(found["input"]["destination"], "Tokyo");
    assert_eq!(found["input"]["date"], "tomorrow");
}

#[tokio::test]
async fn test_expired_template_goes_back_to_planner() {
    let harness = HarnessBuilder::new(flight_plan()).plan_cache().build();
    let orchestrator = harness.orchestrator();

    orchestrator
        .run_workflow("Book a flight to Paris tomorrow", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();

    harness.clock.advance(Duration::hours(25));
    let report = orchestrator
        .run_workflow("Book a flight to Tokyo tomorrow", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();

    assert!(!report.cache_hit);
    assert_eq!(harness.planner.calls(), 2);
}

#[tokio::test]
async fn test_invalid_plans_are_not_cached() {
    let cyclic = vec![
        PlanStep::new("a", "search", json!({})).depends_on(["b"]),
        PlanStep::new("b", "search", json!({})).depends_on(["a"]),
    ];
    let harness = HarnessBuilder::new(cyclic).plan_cache().build();
    let orchestrator = harness.orchestrator();

    for _ in 0..2 {
        let report = orchestrator
            .run_workflow("Search flights to Paris tomorrow", "alice", "trace-1", RunMode::UntilFinished)
            .await
            .unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
    }
    assert_eq!(harness.planner.calls(), 2);
}

fn transfer_plan() -> Vec<PlanStep> {
    vec![PlanStep::new(
        "route",
        "book_transfer",
        json!({"origin": "Paris", "destination": "Tokyo", "tip": "$5", "fee": "$50"}),
    )]
}

#[tokio::test]
async fn test_reversed_route_is_planned_fresh() {
    let harness = HarnessBuilder::new(transfer_plan()).plan_cache().build();
    let orchestrator = harness.orchestrator();

    orchestrator
        .run_workflow("Book a transfer from Paris to Tokyo tipping $5", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();

    let report = orchestrator
        .run_workflow("Book a transfer to Paris from Tokyo tipping $5", "alice", "trace-2", RunMode::UntilFinished)
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(!report.cache_hit);
    assert_eq!(harness.planner.calls(), 2);
}

#[tokio::test]
async fn test_cached_route_keeps_roles_and_unrelated_amounts() {
    let harness = HarnessBuilder::new(transfer_plan()).plan_cache().build();
    let orchestrator = harness.orchestrator();

    orchestrator
        .run_workflow("Book a transfer from Paris to Tokyo tipping $5", "alice", "trace-1", RunMode::UntilFinished)
        .await
        .unwrap();

    let report = orchestrator
        .run_workflow("Book a transfer from Rome to Oslo tipping $9", "alice", "trace-2", RunMode::UntilFinished)
        .await
        .unwrap();

    assert!(report.cache_hit);
    assert_eq!(harness.planner.calls(), 1);
    let routed = report.step("route").unwrap().result.as_ref().unwrap();
    assert_eq!(routed["input"]["origin"], "Rome");
    assert_eq!(routed["input"]["destination"], "Oslo");
    assert_eq!(routed["input"]["tip"], "$9");
    assert_eq!(routed["input"]["fee"], "$50");
}
