//! sagaflow - Saga workflow orchestrator with risk-gated human approvals
//!
//! Goals are turned into plans (from a semantic plan cache or a planner),
//! every step passes a policy and risk-triage gate, risky steps wait for a
//! human decision, and a failed step rolls back the completed ones.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - The saga control loop is a pure state machine over logged events
//! - Every event is appended to the workflow's log before it is applied
//! - Workflows resume from a checksummed snapshot plus the events after it
//!
//! # Modules
//!
//! - `adapters`: Planner, tool, notification and audit interfaces
//! - `core`: Policy, triage, MAN tasks, plan cache, saga machine, runner
//! - `domain`: Data structures (intents, plans, events, workflow state)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a goal against a plan file (returns once approvals are pending)
//! sagaflow run "delete inactive user 42" --plan plan.yaml
//!
//! # Decide the pending approval, then pick the workflow back up
//! sagaflow tasks
//! sagaflow approve <task-id>
//! sagaflow resume <workflow-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorConfig, RunMode, SagaMachine, Services};
pub use domain::{SagaCommand, SagaEvent, Signal, WorkflowReport, WorkflowState, WorkflowStatus};
