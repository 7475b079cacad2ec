//! Events and commands of the saga control loop.
//!
//! Every input to a saga (activity results, gate decisions, operator and
//! approval signals) is a [`SagaEvent`]. Events are appended to the
//! workflow's log before they are applied, so state can always be rebuilt by
//! replaying the log. The control loop answers each event with
//! [`SagaCommand`]s that the outer runner turns into I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::{ActionIntent, RiskTriageResult};
use super::plan::Plan;
use super::policy::PolicyOutcome;
use super::workflow::{WorkflowState, WorkflowStatus};

/// A logged event. The sequence number is strictly increasing per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Position in the workflow's log (starts at 1)
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub workflow_id: Uuid,

    pub event: SagaEvent,

    /// Time taken in milliseconds (activity results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl WorkflowEvent {
    /// Wrap an event with the current timestamp
    pub fn new(workflow_id: Uuid, sequence: u64, event: SagaEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            workflow_id,
            event,
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Inputs to the saga state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaEvent {
    /// A goal was submitted
    Started {
        goal: String,
        user_id: String,
        trace_id: String,
    },

    /// A plan was acquired (from the cache or the planner)
    PlanResolved { plan: Plan },

    /// The planner could not produce a plan
    PlanFailed { error: String },

    /// Policy and triage results for a step
    GateEvaluated {
        step_id: String,
        policy: PolicyOutcome,
        triage: RiskTriageResult,
    },

    /// A MAN task was created for a deferred step
    ApprovalRequested { step_id: String, task_id: Uuid },

    ActivityCompleted {
        step_id: String,
        output: serde_json::Value,
    },

    /// Activity failed after the activity layer exhausted its retries
    ActivityFailed {
        step_id: String,
        error: String,
        attempts: u32,
    },

    /// A compensation finished; `error` is set when it failed
    CompensationFinished {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// External approval or operator signal
    Signal { signal: Signal },
}

impl SagaEvent {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::PlanResolved { .. } => "plan_resolved",
            Self::PlanFailed { .. } => "plan_failed",
            Self::GateEvaluated { .. } => "gate_evaluated",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::CompensationFinished { .. } => "compensation_finished",
            Self::Signal { .. } => "signal",
        }
    }
}

/// Signals delivered to a running saga from outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Approve { task_id: Uuid, approver: String },
    Deny { task_id: Uuid, denier: String, reason: String },
    Expire { task_id: Uuid },
    Pause,
    Resume,
    Stop { reason: String },
    CancelStep { step_id: String },
}

/// Work the runner must perform on behalf of the saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SagaCommand {
    /// Look the goal up in the plan cache, fall back to the planner
    AcquirePlan { goal: String },

    /// Run policy evaluation and risk triage for a step
    EvaluateGate { step_id: String, intent: ActionIntent },

    /// Create a MAN task and notify approvers
    RequestApproval {
        step_id: String,
        intent: ActionIntent,
        triage: RiskTriageResult,
    },

    /// Close the MAN task of a deferred step that will never run
    WithdrawApproval {
        step_id: String,
        task_id: Uuid,
        reason: String,
    },

    /// Call the activity layer
    ExecuteActivity {
        step_id: String,
        tool: String,
        input: serde_json::Value,
        idempotency_key: String,
    },

    /// Undo a completed step (best effort)
    Compensate {
        step_id: String,
        tool: String,
        input: serde_json::Value,
        idempotency_key: String,
    },

    /// History grew past the threshold; persist and restart from this state
    ContinueAsNew { snapshot: Box<WorkflowState> },

    /// The saga reached a terminal status
    Finish { status: WorkflowStatus },
}
