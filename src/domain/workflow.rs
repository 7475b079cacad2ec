//! Workflow state owned by the saga control loop, and the report built from it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::{ActionIntent, RiskTriageResult};
use super::plan::Plan;

/// Overall status of a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Waiting for a plan (cache or planner)
    Planning,

    /// Gating and running steps
    Executing,

    /// A step failed; rolling back completed steps
    Compensating,

    /// Every step reached a terminal state (some may be denied or skipped)
    Completed,

    /// Planning failed or a step failed and the rollback finished
    Failed,

    /// Stopped by an operator
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Executing => "EXECUTING",
            Self::Compensating => "COMPENSATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a single plan step is in its lifecycle.
///
/// Every step of the plan is in exactly one of these states at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    /// Not yet evaluated
    Pending,

    /// Policy and triage requested
    Gating,

    /// Cleared to run, waiting for a free slot (or for resume)
    Ready,

    /// Activity dispatched
    Running,

    /// Waiting on a MAN task decision
    Deferred,

    /// Executed successfully; result recorded
    Done,

    /// Activity failed after retries
    Errored { error: String },

    /// Rejected by policy, triage or a human
    Denied { reason: String },

    /// Approval window elapsed without a decision
    Expired,

    /// Never run because a dependency did not complete, or the saga aborted
    Skipped { reason: String },

    /// Cancelled by an operator or by a stop
    Cancelled,
}

impl StepState {
    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::Errored { .. }
                | Self::Denied { .. }
                | Self::Expired
                | Self::Skipped { .. }
                | Self::Cancelled
        )
    }

    /// Has not started executing and can still be cancelled
    pub fn is_unstarted(&self) -> bool {
        matches!(self, Self::Pending | Self::Gating | Self::Ready | Self::Deferred)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Gating => "gating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Deferred => "deferred",
            Self::Done => "done",
            Self::Errored { .. } => "errored",
            Self::Denied { .. } => "denied",
            Self::Expired => "expired",
            Self::Skipped { .. } => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A step parked on a MAN task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredStep {
    /// Ticket id; `None` until the store has created the ticket
    pub man_task_id: Option<Uuid>,
    pub intent: ActionIntent,
    pub triage: RiskTriageResult,
}

/// Rollback bookkeeping while compensating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationProgress {
    /// Steps still to compensate, next one first
    pub queue: Vec<String>,

    /// Step whose compensation is in flight
    pub current: Option<String>,

    /// Steps whose compensation succeeded, in execution order
    pub compensated: Vec<String>,

    /// Failed compensations as (step_id, error)
    pub failures: Vec<(String, String)>,
}

/// Complete state of one saga; serialised verbatim into snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Uuid,
    pub goal: String,
    pub user_id: String,
    pub trace_id: String,
    pub status: WorkflowStatus,

    #[serde(default)]
    pub plan: Option<Plan>,

    /// One entry per plan step
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,

    /// Outputs of completed steps
    #[serde(default)]
    pub step_results: BTreeMap<String, serde_json::Value>,

    /// Steps waiting on a MAN task
    #[serde(default)]
    pub deferred_steps: BTreeMap<String, DeferredStep>,

    /// Step ids in the order they finished successfully
    #[serde(default)]
    pub completion_order: Vec<String>,

    #[serde(default)]
    pub compensation: Option<CompensationProgress>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub stop_reason: Option<String>,

    /// Why the saga failed (planning error or failing step)
    #[serde(default)]
    pub failure: Option<String>,

    /// Events applied since the last checkpoint
    #[serde(default)]
    pub history_size: u64,
}

impl WorkflowState {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            goal: String::new(),
            user_id: String::new(),
            trace_id: String::new(),
            status: WorkflowStatus::Planning,
            plan: None,
            step_states: BTreeMap::new(),
            step_results: BTreeMap::new(),
            deferred_steps: BTreeMap::new(),
            completion_order: Vec::new(),
            compensation: None,
            paused: false,
            stop_reason: None,
            failure: None,
            history_size: 0,
        }
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// Step currently parked on the given MAN task
    pub fn step_for_task(&self, task_id: Uuid) -> Option<&str> {
        self.deferred_steps
            .iter()
            .find(|(_, d)| d.man_task_id == Some(task_id))
            .map(|(id, _)| id.as_str())
    }
}

/// User-facing view of a saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub cache_hit: bool,
    pub steps: Vec<StepReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl WorkflowReport {
    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Build a report; deferred steps with a ticket get a dashboard link
    pub fn from_state(state: &WorkflowState, dashboard_url: &str) -> Self {
        let steps = state
            .plan
            .iter()
            .flat_map(|plan| plan.steps.iter())
            .map(|step| {
                let step_state = state
                    .step_states
                    .get(&step.id)
                    .cloned()
                    .unwrap_or(StepState::Pending);
                let man_task_id = state
                    .deferred_steps
                    .get(&step.id)
                    .and_then(|d| d.man_task_id);
                let dashboard_url = match (&step_state, man_task_id) {
                    (StepState::Deferred, Some(task_id)) => Some(format!(
                        "{}/tasks/{}",
                        dashboard_url.trim_end_matches('/'),
                        task_id
                    )),
                    _ => None,
                };
                StepReport {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    result: state.step_results.get(&step.id).cloned(),
                    state: step_state,
                    man_task_id,
                    dashboard_url,
                }
            })
            .collect();

        Self {
            workflow_id: state.workflow_id,
            status: state.status,
            cache_hit: state.plan.as_ref().map(|p| p.cache_hit).unwrap_or(false),
            steps,
            failure: state.failure.clone(),
            stop_reason: state.stop_reason.clone(),
        }
    }
}

/// Outcome of one step as shown to users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub tool: String,
    pub state: StepState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub man_task_id: Option<Uuid>,

    /// Where a human can decide on the pending ticket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}
