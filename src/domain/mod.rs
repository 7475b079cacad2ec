//! Domain types for the sagaflow orchestrator.
//!
//! This module contains the core data structures:
//! - Intent: tool calls and their risk classification
//! - Policy: policy contexts and decisions
//! - ManTask: human approval tickets
//! - Plan: plans, steps and cached templates
//! - Workflow: saga state and reports
//! - Events: saga events, signals and commands

pub mod events;
pub mod intent;
pub mod man_task;
pub mod plan;
pub mod policy;
pub mod workflow;

// Re-export commonly used types
pub use events::{SagaCommand, SagaEvent, Signal, WorkflowEvent};
pub use intent::{ActionIntent, RiskLane, RiskTriageResult};
pub use man_task::{ManDecision, ManTask, ManTaskStatus};
pub use plan::{Plan, PlanFile, PlanStep, PlanTemplate};
pub use policy::{PolicyContext, PolicyDecision, PolicyOutcome};
pub use workflow::{
    CompensationProgress, DeferredStep, StepReport, StepState, WorkflowReport, WorkflowState, WorkflowStatus,
};
