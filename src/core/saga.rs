//! The saga control loop as a pure state machine.
//!
//! [`SagaMachine::apply`] takes one event and returns the commands the runner
//! has to carry out. It does no I/O, reads no clock and draws no random
//! numbers, so replaying the same event log always rebuilds the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{
    ActionIntent, CompensationProgress, DeferredStep, Plan, PlanStep, PolicyDecision, PolicyOutcome, RiskLane,
    RiskTriageResult, SagaCommand, SagaEvent, Signal, StepState, WorkflowState, WorkflowStatus,
};

use super::graph::{PlanningError, StepGraph};

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Snapshot for workflow {workflow_id} is corrupt: {reason}")]
    SnapshotCorruption { workflow_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SagaSettings {
    /// Maximum number of activities running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Events applied before the machine asks to continue as new
    #[serde(default = "default_history_threshold")]
    pub history_threshold: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_history_threshold() -> u64 {
    1000
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            history_threshold: default_history_threshold(),
        }
    }
}

/// Idempotency key for a step's forward activity
pub fn activity_key(workflow_id: Uuid, step_id: &str, tool: &str) -> String {
    format!("{}:{}:{}", workflow_id, step_id, tool)
}

/// Idempotency key for a step's compensation
pub fn compensation_key(workflow_id: Uuid, step_id: &str, tool: &str) -> String {
    format!("{}:{}:{}:compensate", workflow_id, step_id, tool)
}

/// Intent the gate evaluates for a plan step
pub fn intent_for_step(workflow_id: Uuid, step: &PlanStep) -> ActionIntent {
    let params: BTreeMap<String, serde_json::Value> = match &step.input {
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        serde_json::Value::Null => BTreeMap::new(),
        other => BTreeMap::from([("input".to_string(), other.clone())]),
    };

    let intent = ActionIntent::new(&step.tool, params, workflow_id, &step.id).irreversible(step.irreversible);
    match &step.rationale {
        Some(rationale) => intent.with_rationale(rationale),
        None => intent,
    }
}

pub struct SagaMachine {
    state: WorkflowState,
    graph: Option<StepGraph>,
    settings: SagaSettings,
}

impl SagaMachine {
    pub fn new(workflow_id: Uuid, settings: SagaSettings) -> Self {
        Self {
            state: WorkflowState::new(workflow_id),
            graph: None,
            settings,
        }
    }

    /// Reseed a machine from a snapshot, checking it is internally consistent
    pub fn from_snapshot(state: WorkflowState, settings: SagaSettings) -> Result<Self, SagaError> {
        let corrupt = |reason: String| SagaError::SnapshotCorruption {
            workflow_id: state.workflow_id,
            reason,
        };

        let graph = match &state.plan {
            Some(plan) => {
                let graph = StepGraph::build(&plan.steps).map_err(|e| corrupt(e.to_string()))?;
                for id in graph.ids() {
                    if !state.step_states.contains_key(id) {
                        return Err(corrupt(format!("step '{}' has no state", id)));
                    }
                }
                if state.step_states.len() != graph.ids().len() {
                    return Err(corrupt("state recorded for a step outside the plan".to_string()));
                }
                Some(graph)
            }
            None if !state.step_states.is_empty() => {
                return Err(corrupt("step states without a plan".to_string()));
            }
            None => None,
        };

        for step_id in state.deferred_steps.keys() {
            if state.step_states.get(step_id) != Some(&StepState::Deferred) {
                return Err(corrupt(format!("deferred entry for step '{}' not in deferred state", step_id)));
            }
        }
        for step_id in &state.completion_order {
            if state.step_states.get(step_id) != Some(&StepState::Done) {
                return Err(corrupt(format!("completed step '{}' is not done", step_id)));
            }
        }

        Ok(Self { state, graph, settings })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn into_state(self) -> WorkflowState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.status.is_terminal()
    }

    /// Apply one event and return the commands it produces
    pub fn apply(&mut self, event: &SagaEvent) -> Vec<SagaCommand> {
        if self.is_finished() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        match event {
            SagaEvent::Started {
                goal,
                user_id,
                trace_id,
            } => self.on_started(goal, user_id, trace_id, &mut commands),
            SagaEvent::PlanResolved { plan } => self.on_plan_resolved(plan, &mut commands),
            SagaEvent::PlanFailed { error } => {
                if self.state.status == WorkflowStatus::Planning {
                    let error = PlanningError::PlannerFailed(error.clone());
                    self.fail_planning(error, &mut commands);
                }
            }
            SagaEvent::GateEvaluated {
                step_id,
                policy,
                triage,
            } => self.on_gate_evaluated(step_id, policy, triage, &mut commands),
            SagaEvent::ApprovalRequested { step_id, task_id } => {
                match self.state.deferred_steps.get_mut(step_id) {
                    Some(deferred) => deferred.man_task_id = Some(*task_id),
                    // Task was created after the step stopped waiting
                    None => commands.push(SagaCommand::WithdrawApproval {
                        step_id: step_id.clone(),
                        task_id: *task_id,
                        reason: "step no longer waiting for approval".to_string(),
                    }),
                }
            }
            SagaEvent::ActivityCompleted { step_id, output } => {
                if self.state.step_states.get(step_id) == Some(&StepState::Running) {
                    self.set_state(step_id, StepState::Done);
                    self.state.step_results.insert(step_id.clone(), output.clone());
                    self.state.completion_order.push(step_id.clone());
                }
            }
            SagaEvent::ActivityFailed { step_id, error, .. } => {
                self.on_activity_failed(step_id, error, &mut commands)
            }
            SagaEvent::CompensationFinished { step_id, error } => {
                if let Some(progress) = self.state.compensation.as_mut() {
                    if progress.current.as_deref() == Some(step_id.as_str()) {
                        progress.current = None;
                        match error {
                            Some(e) => progress.failures.push((step_id.clone(), e.clone())),
                            None => progress.compensated.push(step_id.clone()),
                        }
                    }
                }
            }
            SagaEvent::Signal { signal } => self.on_signal(signal, &mut commands),
        }

        self.advance(&mut commands);

        self.state.history_size += 1;
        if !self.is_finished() && self.state.history_size > self.settings.history_threshold {
            self.state.history_size = 0;
            commands.push(SagaCommand::ContinueAsNew {
                snapshot: Box::new(self.state.clone()),
            });
        }
        commands
    }

    /// Commands that were issued but whose results are not in the state yet.
    ///
    /// Used after a restart: the runner reissues these (activities are
    /// deduplicated by idempotency key) before waiting for new events.
    pub fn outstanding_commands(&self) -> Vec<SagaCommand> {
        let mut commands = Vec::new();
        if self.is_finished() {
            return commands;
        }

        if self.state.status == WorkflowStatus::Planning {
            if !self.state.goal.is_empty() {
                commands.push(SagaCommand::AcquirePlan {
                    goal: self.state.goal.clone(),
                });
            }
            return commands;
        }

        for step in self.plan_steps() {
            match self.state.step_states.get(&step.id) {
                Some(StepState::Gating) => commands.push(SagaCommand::EvaluateGate {
                    step_id: step.id.clone(),
                    intent: intent_for_step(self.state.workflow_id, step),
                }),
                Some(StepState::Running) => commands.push(self.execute_command(step)),
                Some(StepState::Deferred) => {
                    if let Some(deferred) = self.state.deferred_steps.get(&step.id) {
                        if deferred.man_task_id.is_none() {
                            commands.push(SagaCommand::RequestApproval {
                                step_id: step.id.clone(),
                                intent: deferred.intent.clone(),
                                triage: deferred.triage.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(current) = self.state.compensation.as_ref().and_then(|p| p.current.as_ref()) {
            if let Some(command) = self.compensate_command(current) {
                commands.push(command);
            }
        }
        commands
    }

    fn on_started(&mut self, goal: &str, user_id: &str, trace_id: &str, commands: &mut Vec<SagaCommand>) {
        if self.state.status != WorkflowStatus::Planning || !self.state.goal.is_empty() {
            return;
        }
        self.state.goal = goal.to_string();
        self.state.user_id = user_id.to_string();
        self.state.trace_id = trace_id.to_string();
        commands.push(SagaCommand::AcquirePlan { goal: goal.to_string() });
    }

    fn on_plan_resolved(&mut self, plan: &Plan, commands: &mut Vec<SagaCommand>) {
        if self.state.status != WorkflowStatus::Planning || self.state.plan.is_some() {
            return;
        }

        match StepGraph::build(&plan.steps) {
            Ok(graph) => {
                self.state.step_states = plan
                    .steps
                    .iter()
                    .map(|s| (s.id.clone(), StepState::Pending))
                    .collect();
                self.state.plan = Some(plan.clone());
                self.state.status = WorkflowStatus::Executing;
                self.graph = Some(graph);
            }
            Err(e) => self.fail_planning(e, commands),
        }
    }

    fn fail_planning(&mut self, error: PlanningError, commands: &mut Vec<SagaCommand>) {
        warn!(workflow_id = %self.state.workflow_id, error = %error, "Planning failed");
        self.state.failure = Some(error.to_string());
        self.finish(WorkflowStatus::Failed, commands);
    }

    fn on_gate_evaluated(
        &mut self,
        step_id: &str,
        policy: &PolicyOutcome,
        triage: &RiskTriageResult,
        commands: &mut Vec<SagaCommand>,
    ) {
        if self.state.step_states.get(step_id) != Some(&StepState::Gating) {
            warn!(step = step_id, "Gate result for a step that is not gating; ignored");
            return;
        }

        let lane = policy.lane.max(triage.lane);

        if policy.decision == PolicyDecision::Deny {
            let reason = format!("policy {}: {}", policy.policy_name, policy.reason);
            self.reject(step_id, StepState::Denied { reason });
            return;
        }
        if lane == RiskLane::Blocked {
            let reason = format!("blocked: {}", triage.reason);
            self.reject(step_id, StepState::Denied { reason });
            return;
        }

        if policy.decision == PolicyDecision::Defer || triage.requires_approval {
            let Some(step) = self.plan_step(step_id) else {
                return;
            };
            let intent = intent_for_step(self.state.workflow_id, step);
            let mut triage = triage.clone();
            triage.lane = lane;
            triage.requires_approval = true;

            commands.push(SagaCommand::RequestApproval {
                step_id: step_id.to_string(),
                intent: intent.clone(),
                triage: triage.clone(),
            });
            self.state.deferred_steps.insert(
                step_id.to_string(),
                DeferredStep {
                    man_task_id: None,
                    intent,
                    triage,
                },
            );
            self.set_state(step_id, StepState::Deferred);
            return;
        }

        self.set_state(step_id, StepState::Ready);
    }

    fn on_activity_failed(&mut self, step_id: &str, error: &str, commands: &mut Vec<SagaCommand>) {
        if self.state.step_states.get(step_id) != Some(&StepState::Running) {
            return;
        }
        self.set_state(
            step_id,
            StepState::Errored {
                error: error.to_string(),
            },
        );

        if self.state.status != WorkflowStatus::Executing || self.state.stop_reason.is_some() {
            return;
        }

        self.state.failure = Some(format!("step '{}' failed: {}", step_id, error));
        self.state.status = WorkflowStatus::Compensating;
        self.withdraw_all_deferred("saga aborted", commands);
        for state in self.state.step_states.values_mut() {
            match state {
                StepState::Pending | StepState::Gating | StepState::Ready => {
                    *state = StepState::Skipped {
                        reason: "saga_aborted".to_string(),
                    }
                }
                StepState::Deferred => *state = StepState::Cancelled,
                _ => {}
            }
        }
    }

    fn on_signal(&mut self, signal: &Signal, commands: &mut Vec<SagaCommand>) {
        match signal {
            Signal::Approve { task_id, approver } => {
                let Some(step_id) = self.deferred_step_for(*task_id) else {
                    return;
                };
                self.state.deferred_steps.remove(&step_id);
                self.set_state(&step_id, StepState::Ready);
                tracing::debug!(step = %step_id, approver = %approver, "Step approved");
            }
            Signal::Deny {
                task_id,
                denier,
                reason,
            } => {
                let Some(step_id) = self.deferred_step_for(*task_id) else {
                    return;
                };
                let reason = format!("denied by {}: {}", denier, reason);
                self.reject(&step_id, StepState::Denied { reason });
            }
            Signal::Expire { task_id } => {
                let Some(step_id) = self.deferred_step_for(*task_id) else {
                    return;
                };
                self.reject(&step_id, StepState::Expired);
            }
            Signal::Pause => self.state.paused = true,
            Signal::Resume => self.state.paused = false,
            Signal::Stop { reason } => self.on_stop(reason, commands),
            Signal::CancelStep { step_id } => match self.state.step_states.get(step_id).cloned() {
                Some(state) if state.is_unstarted() => {
                    if let Some(deferred) = self.state.deferred_steps.remove(step_id) {
                        withdraw(step_id, deferred, "step cancelled", commands);
                    }
                    self.reject(step_id, StepState::Cancelled);
                }
                Some(state) => {
                    warn!(step = %step_id, state = state.label(), "Cannot cancel a step that already started")
                }
                None => warn!(step = %step_id, "Cancel for unknown step ignored"),
            },
        }
    }

    fn on_stop(&mut self, reason: &str, commands: &mut Vec<SagaCommand>) {
        if self.state.stop_reason.is_some() {
            return;
        }
        if self.state.status == WorkflowStatus::Compensating {
            warn!(reason, "Stop requested during rollback; rollback continues");
            return;
        }

        self.state.stop_reason = Some(reason.to_string());
        self.withdraw_all_deferred(&format!("workflow stopped: {}", reason), commands);
        for state in self.state.step_states.values_mut() {
            if state.is_unstarted() {
                *state = StepState::Cancelled;
            }
        }
    }

    /// Drop every parked step, closing the MAN tasks already created for them
    fn withdraw_all_deferred(&mut self, reason: &str, commands: &mut Vec<SagaCommand>) {
        for (step_id, deferred) in std::mem::take(&mut self.state.deferred_steps) {
            withdraw(&step_id, deferred, reason, commands);
        }
    }

    /// Step parked on a MAN task, if that task is still relevant
    fn deferred_step_for(&self, task_id: Uuid) -> Option<String> {
        let step_id = self.state.step_for_task(task_id).map(str::to_string);
        if step_id.is_none() {
            warn!(%task_id, "Signal for a task with no deferred step; ignored");
        }
        step_id
    }

    /// Move a step to a not-run state and skip everything downstream of it
    fn reject(&mut self, step_id: &str, terminal: StepState) {
        let label = terminal.label();
        self.state.deferred_steps.remove(step_id);
        self.set_state(step_id, terminal);

        let descendants: Vec<String> = match &self.graph {
            Some(graph) => graph.descendants(step_id).into_iter().map(str::to_string).collect(),
            None => Vec::new(),
        };
        for id in descendants {
            if self.state.step_states.get(&id) == Some(&StepState::Pending) {
                self.set_state(
                    &id,
                    StepState::Skipped {
                        reason: format!("dependency '{}' {}", step_id, label),
                    },
                );
            }
        }
    }

    /// Drive the saga forward as far as the current state allows
    fn advance(&mut self, commands: &mut Vec<SagaCommand>) {
        match self.state.status {
            WorkflowStatus::Executing => {
                if self.state.stop_reason.is_some() {
                    if self.running_count() == 0 {
                        self.finish(WorkflowStatus::Stopped, commands);
                    }
                    return;
                }
                self.promote_pending(commands);
                self.dispatch_ready(commands);
                if self.state.step_states.values().all(StepState::is_terminal) {
                    self.finish(WorkflowStatus::Completed, commands);
                }
            }
            WorkflowStatus::Compensating => self.advance_rollback(commands),
            WorkflowStatus::Planning if self.state.stop_reason.is_some() => {
                self.finish(WorkflowStatus::Stopped, commands);
            }
            _ => {}
        }
    }

    /// Send pending steps whose dependencies settled to the gate (or skip them)
    fn promote_pending(&mut self, commands: &mut Vec<SagaCommand>) {
        let Some(graph) = self.graph.clone() else {
            return;
        };

        // Skipping a step can settle steps earlier in plan order
        let mut changed = true;
        while changed {
            changed = false;
            for id in graph.ids() {
                if self.state.step_states.get(id) != Some(&StepState::Pending) {
                    continue;
                }

                let mut blocker = None;
                let mut settled = true;
                for dep in graph.dependencies_of(id) {
                    match self.state.step_states.get(dep) {
                        Some(StepState::Done) => {}
                        Some(state) if state.is_terminal() => {
                            blocker.get_or_insert((dep.to_string(), state.label()));
                        }
                        _ => settled = false,
                    }
                }
                if !settled {
                    continue;
                }

                changed = true;
                match blocker {
                    Some((dep, label)) => self.set_state(
                        id,
                        StepState::Skipped {
                            reason: format!("dependency '{}' {}", dep, label),
                        },
                    ),
                    None => {
                        let Some(step) = self.plan_step(id) else {
                            continue;
                        };
                        commands.push(SagaCommand::EvaluateGate {
                            step_id: id.clone(),
                            intent: intent_for_step(self.state.workflow_id, step),
                        });
                        self.set_state(id, StepState::Gating);
                    }
                }
            }
        }
    }

    fn dispatch_ready(&mut self, commands: &mut Vec<SagaCommand>) {
        if self.state.paused {
            return;
        }
        let ready: Vec<String> = self
            .plan_steps()
            .filter(|s| self.state.step_states.get(&s.id) == Some(&StepState::Ready))
            .map(|s| s.id.clone())
            .collect();

        for step_id in ready {
            if self.running_count() >= self.settings.max_concurrency {
                break;
            }
            let Some(step) = self.plan_step(&step_id) else {
                continue;
            };
            commands.push(self.execute_command(step));
            self.set_state(&step_id, StepState::Running);
        }
    }

    fn advance_rollback(&mut self, commands: &mut Vec<SagaCommand>) {
        if self.running_count() > 0 {
            return;
        }

        if self.state.compensation.is_none() {
            let queue = self
                .state
                .completion_order
                .iter()
                .rev()
                .filter(|id| self.plan_step(id).is_some_and(|s| s.compensation_tool.is_some()))
                .cloned()
                .collect();
            self.state.compensation = Some(CompensationProgress {
                queue,
                ..Default::default()
            });
        }

        let next = match self.state.compensation.as_mut() {
            Some(progress) if progress.current.is_none() => {
                if progress.queue.is_empty() {
                    None
                } else {
                    let next = progress.queue.remove(0);
                    progress.current = Some(next.clone());
                    Some(next)
                }
            }
            _ => return,
        };

        match next {
            Some(step_id) => {
                if let Some(command) = self.compensate_command(&step_id) {
                    commands.push(command);
                }
            }
            None => self.finish(WorkflowStatus::Failed, commands),
        }
    }

    fn finish(&mut self, status: WorkflowStatus, commands: &mut Vec<SagaCommand>) {
        self.state.status = status;
        commands.push(SagaCommand::Finish { status });
    }

    fn execute_command(&self, step: &PlanStep) -> SagaCommand {
        SagaCommand::ExecuteActivity {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            input: step.input.clone(),
            idempotency_key: activity_key(self.state.workflow_id, &step.id, &step.tool),
        }
    }

    fn compensate_command(&self, step_id: &str) -> Option<SagaCommand> {
        let step = self.plan_step(step_id)?;
        let tool = step.compensation_tool.as_ref()?;
        let result = self
            .state
            .step_results
            .get(step_id)
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        Some(SagaCommand::Compensate {
            step_id: step_id.to_string(),
            tool: tool.clone(),
            input: serde_json::json!({ "input": step.input, "result": result }),
            idempotency_key: compensation_key(self.state.workflow_id, step_id, tool),
        })
    }

    fn running_count(&self) -> usize {
        self.state
            .step_states
            .values()
            .filter(|s| **s == StepState::Running)
            .count()
    }

    fn set_state(&mut self, step_id: &str, state: StepState) {
        if let Some(slot) = self.state.step_states.get_mut(step_id) {
            *slot = state;
        }
    }

    fn plan_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.state.plan.iter().flat_map(|p| p.steps.iter())
    }

    fn plan_step(&self, step_id: &str) -> Option<&PlanStep> {
        self.state.plan.as_ref().and_then(|p| p.get_step(step_id))
    }
}

fn withdraw(step_id: &str, deferred: DeferredStep, reason: &str, commands: &mut Vec<SagaCommand>) {
    // No ticket yet: the late ApprovalRequested withdraws it instead
    if let Some(task_id) = deferred.man_task_id {
        commands.push(SagaCommand::WithdrawApproval {
            step_id: step_id.to_string(),
            task_id,
            reason: reason.to_string(),
        });
    }
}
