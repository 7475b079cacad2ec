//! Outer runner for sagas.
//!
//! Owns the injected services, logs every event before the state machine
//! sees it, turns commands into I/O and routes signals to live workflows.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    ActivityExecutor, ActivityOutcome, ActivityRequest, AuditRecord, AuditSink, CompensationOutcome, Notice,
    Notifications, Planner,
};
use crate::domain::{
    ActionIntent, ManTask, ManTaskStatus, Plan, PolicyContext, PolicyOutcome, RiskLane, RiskTriageResult,
    SagaCommand, SagaEvent, Signal, StepState, WorkflowEvent, WorkflowReport, WorkflowState,
};

use super::clock::{Clock, SystemClock};
use super::event_store::EventStore;
use super::graph::StepGraph;
use super::man_store::{ManStoreError, ManTaskStore};
use super::plan_cache::SemanticPlanCache;
use super::policy::PolicyEvaluator;
use super::saga::{SagaMachine, SagaSettings};
use super::triage::RiskTriageEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(flatten)]
    pub saga: SagaSettings,

    /// Base URL for MAN task links in reports and notices
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,

    /// Approval window when triage does not suggest one
    #[serde(default = "default_approval_timeout_hours")]
    pub default_approval_timeout_hours: u32,
}

fn default_dashboard_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_approval_timeout_hours() -> u32 {
    24
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            saga: SagaSettings::default(),
            dashboard_url: default_dashboard_url(),
            default_approval_timeout_hours: default_approval_timeout_hours(),
        }
    }
}

/// Everything the runner talks to
pub struct Services {
    pub planner: Arc<dyn Planner>,
    pub activities: Arc<dyn ActivityExecutor>,
    pub policy: Arc<PolicyEvaluator>,
    pub triage: RiskTriageEngine,
    pub man_store: Arc<ManTaskStore>,
    pub plan_cache: Option<Arc<SemanticPlanCache>>,
    pub notifications: Arc<Notifications>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn new(
        planner: Arc<dyn Planner>,
        activities: Arc<dyn ActivityExecutor>,
        policy: Arc<PolicyEvaluator>,
        man_store: Arc<ManTaskStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            planner,
            activities,
            policy,
            triage: RiskTriageEngine::default(),
            man_store,
            plan_cache: None,
            notifications: Arc::new(Notifications::default()),
            audit,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_triage(mut self, triage: RiskTriageEngine) -> Self {
        self.triage = triage;
        self
    }

    pub fn with_plan_cache(mut self, cache: Arc<SemanticPlanCache>) -> Self {
        self.plan_cache = Some(cache);
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<Notifications>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// When a drive loop hands control back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for signals until the workflow reaches a terminal status
    UntilFinished,

    /// Return as soon as nothing is in flight and only signals could make progress
    UntilIdle,
}

type TaskResult = (SagaEvent, Option<u64>);

/// State of one drive loop
struct WorkflowRun {
    store: EventStore,
    machine: SagaMachine,
    sequence: u64,
    inbox: VecDeque<TaskResult>,
    tasks: JoinSet<TaskResult>,
    timers: JoinSet<()>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl WorkflowRun {
    fn workflow_id(&self) -> Uuid {
        self.store.workflow_id()
    }

    /// Log an event, then apply it
    async fn record(&mut self, event: SagaEvent, duration_ms: Option<u64>) -> Result<Vec<SagaCommand>> {
        self.sequence += 1;
        let mut logged = WorkflowEvent::new(self.workflow_id(), self.sequence, event);
        if let Some(ms) = duration_ms {
            logged = logged.with_duration(ms);
        }
        self.store
            .append(&logged)
            .await
            .context("Failed to log workflow event")?;

        debug!(sequence = self.sequence, kind = logged.event.kind(), "Applying event");
        Ok(self.machine.apply(&logged.event))
    }
}

/// Removes a workflow's signal channel when its drive loop ends
struct LiveWorkflow<'a> {
    signals: &'a Mutex<HashMap<Uuid, mpsc::UnboundedSender<Signal>>>,
    workflow_id: Uuid,
}

impl Drop for LiveWorkflow<'_> {
    fn drop(&mut self) {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.workflow_id);
    }
}

pub struct Orchestrator {
    services: Arc<Services>,
    config: OrchestratorConfig,
    workflows_dir: PathBuf,
    signals: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Signal>>>,
}

impl Orchestrator {
    pub fn new(services: Services, config: OrchestratorConfig, workflows_dir: impl Into<PathBuf>) -> Self {
        Self {
            services: Arc::new(services),
            config,
            workflows_dir: workflows_dir.into(),
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn workflows_dir(&self) -> &Path {
        &self.workflows_dir
    }

    /// Create a workflow and log its start event. Nothing runs until it is driven.
    ///
    /// `trace_id` is the caller's correlation id; it is carried on the start
    /// event and on the workflow's audit records.
    #[instrument(skip(self, goal))]
    pub async fn submit_goal(&self, goal: &str, user_id: &str, trace_id: &str) -> Result<Uuid> {
        if goal.trim().is_empty() {
            anyhow::bail!("Goal must not be empty");
        }
        if trace_id.trim().is_empty() {
            anyhow::bail!("Trace id must not be empty");
        }

        let workflow_id = Uuid::new_v4();
        let store = EventStore::open(&self.workflows_dir, workflow_id).await?;
        let started = SagaEvent::Started {
            goal: goal.to_string(),
            user_id: user_id.to_string(),
            trace_id: trace_id.to_string(),
        };
        store.append(&WorkflowEvent::new(workflow_id, 1, started)).await?;

        self.services.audit.record(
            AuditRecord::new(user_id, "workflow.submit", workflow_id.to_string(), "accepted")
                .with_metadata(serde_json::json!({ "goal": goal, "trace_id": trace_id })),
        );
        info!(%workflow_id, "Workflow submitted");
        Ok(workflow_id)
    }

    /// Submit a goal and drive the new workflow
    #[instrument(skip(self, goal))]
    pub async fn run_workflow(
        &self,
        goal: &str,
        user_id: &str,
        trace_id: &str,
        mode: RunMode,
    ) -> Result<WorkflowReport> {
        let workflow_id = self.submit_goal(goal, user_id, trace_id).await?;
        self.drive(workflow_id, mode).await
    }

    /// Rebuild a workflow from its snapshot and log, then keep driving it
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn resume_workflow(&self, workflow_id: Uuid, mode: RunMode) -> Result<WorkflowReport> {
        self.ensure_exists(workflow_id)?;
        info!("Resuming workflow");
        self.drive(workflow_id, mode).await
    }

    /// Report for a workflow, rebuilt from disk
    pub async fn workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowReport> {
        let state = self.load_state(workflow_id).await?;
        Ok(WorkflowReport::from_state(&state, &self.config.dashboard_url))
    }

    /// Current state of a workflow without driving it
    pub async fn load_state(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.ensure_exists(workflow_id)?;
        let store = EventStore::open(&self.workflows_dir, workflow_id).await?;
        let (machine, _) = self.load_machine(&store).await?;
        Ok(machine.into_state())
    }

    pub async fn list_workflows(&self) -> Result<Vec<Uuid>> {
        EventStore::list_workflows(&self.workflows_dir).await
    }

    /// Approve a MAN task and wake its workflow
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn approve(&self, task_id: Uuid, approver: &str) -> Result<ManTask> {
        let task = self
            .services
            .man_store
            .approve(task_id, approver)
            .with_context(|| format!("Failed to approve MAN task {}", task_id))?;
        self.audit_decision(&task, approver, "man_task.approve");
        self.deliver(
            task.workflow_id,
            Signal::Approve {
                task_id,
                approver: approver.to_string(),
            },
        );
        Ok(task)
    }

    /// Deny a MAN task and wake its workflow
    #[instrument(skip(self, reason), fields(task_id = %task_id))]
    pub fn deny(&self, task_id: Uuid, denier: &str, reason: &str) -> Result<ManTask> {
        let task = self
            .services
            .man_store
            .deny(task_id, denier, reason)
            .with_context(|| format!("Failed to deny MAN task {}", task_id))?;
        self.audit_decision(&task, denier, "man_task.deny");
        self.deliver(
            task.workflow_id,
            Signal::Deny {
                task_id,
                denier: denier.to_string(),
                reason: reason.to_string(),
            },
        );
        Ok(task)
    }

    /// Hand a PENDING task to a wider approver group.
    ///
    /// The task stays open, so the workflow keeps waiting and is not signalled.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn escalate(&self, task_id: Uuid, actor: &str) -> Result<ManTask> {
        let task = self
            .services
            .man_store
            .escalate(task_id, actor)
            .with_context(|| format!("Failed to escalate MAN task {}", task_id))?;
        self.audit_decision(&task, actor, "man_task.escalate");
        Ok(task)
    }

    /// Expire every open MAN task past its deadline
    #[instrument(skip(self))]
    pub fn expire_overdue(&self) -> Result<Vec<ManTask>> {
        let expired = self
            .services
            .man_store
            .expire_overdue()
            .context("Failed to expire overdue MAN tasks")?;

        for task in &expired {
            self.audit_decision(task, "system", "man_task.expire");
            self.deliver(task.workflow_id, Signal::Expire { task_id: task.task_id });
        }
        Ok(expired)
    }

    pub async fn pause(&self, workflow_id: Uuid) -> Result<()> {
        self.signal(workflow_id, Signal::Pause).await
    }

    pub async fn resume(&self, workflow_id: Uuid) -> Result<()> {
        self.signal(workflow_id, Signal::Resume).await
    }

    pub async fn stop(&self, workflow_id: Uuid, reason: &str) -> Result<()> {
        self.signal(
            workflow_id,
            Signal::Stop {
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn cancel_step(&self, workflow_id: Uuid, step_id: &str) -> Result<()> {
        self.signal(
            workflow_id,
            Signal::CancelStep {
                step_id: step_id.to_string(),
            },
        )
        .await
    }

    /// Send an operator signal. Workflows that are not running get it
    /// appended to their log and apply it when next driven.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    async fn signal(&self, workflow_id: Uuid, signal: Signal) -> Result<()> {
        self.ensure_exists(workflow_id)?;
        if self.deliver(workflow_id, signal.clone()) {
            return Ok(());
        }

        let store = EventStore::open(&self.workflows_dir, workflow_id).await?;
        let sequence = store.last_sequence().await? + 1;
        store
            .append(&WorkflowEvent::new(workflow_id, sequence, SagaEvent::Signal { signal }))
            .await?;
        info!(sequence, "Signal logged for next run");
        Ok(())
    }

    /// Hand a signal to a live drive loop. Returns false if none is running.
    fn deliver(&self, workflow_id: Uuid, signal: Signal) -> bool {
        let signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        match signals.get(&workflow_id) {
            Some(sender) => sender.send(signal).is_ok(),
            None => {
                debug!(%workflow_id, "Workflow not running; signal waits for resume");
                false
            }
        }
    }

    fn ensure_exists(&self, workflow_id: Uuid) -> Result<()> {
        if !self.workflows_dir.join(workflow_id.to_string()).is_dir() {
            anyhow::bail!("Workflow {} not found", workflow_id);
        }
        Ok(())
    }

    fn audit_decision(&self, task: &ManTask, actor: &str, action: &str) {
        self.services.audit.record(
            AuditRecord::new(actor, action, task.task_id.to_string(), task.status.as_str()).with_metadata(
                serde_json::json!({
                    "workflow_id": task.workflow_id,
                    "step_id": task.step_id,
                    "tool": task.intent.tool_name,
                }),
            ),
        );
    }

    /// A BLOCKED step never runs; every attempt is still recorded
    fn audit_blocked(
        &self,
        state: &WorkflowState,
        step_id: &str,
        intent: &ActionIntent,
        policy: &PolicyOutcome,
        triage: &RiskTriageResult,
    ) {
        warn!(step = %step_id, tool = %intent.tool_name, reason = %triage.reason, "Step blocked");
        self.services.audit.record(
            AuditRecord::new(
                &state.user_id,
                "step.blocked",
                format!("{}:{}", state.workflow_id, step_id),
                RiskLane::Blocked.to_string(),
            )
            .with_metadata(serde_json::json!({
                "trace_id": state.trace_id,
                "tool": intent.tool_name,
                "policy": policy.policy_name,
                "policy_decision": policy.decision,
                "policy_lane": policy.lane,
                "triage_lane": triage.lane,
                "triage_reason": triage.reason,
            })),
        );
    }

    /// Snapshot (if any) plus the events logged after it
    async fn load_machine(&self, store: &EventStore) -> Result<(SagaMachine, u64)> {
        let (mut machine, mut sequence) = match store.load_snapshot().await? {
            Some(snapshot) => {
                debug!(last_sequence = snapshot.last_sequence, "Loaded snapshot");
                let machine = SagaMachine::from_snapshot(snapshot.state, self.config.saga)?;
                (machine, snapshot.last_sequence)
            }
            None => (SagaMachine::new(store.workflow_id(), self.config.saga), 0),
        };

        let events = store.replay_after(sequence).await?;
        if sequence == 0 && events.is_empty() {
            anyhow::bail!("Workflow {} has no history", store.workflow_id());
        }
        for logged in events {
            machine.apply(&logged.event);
            sequence = logged.sequence;
        }
        Ok((machine, sequence))
    }

    async fn drive(&self, workflow_id: Uuid, mode: RunMode) -> Result<WorkflowReport> {
        let store = EventStore::open(&self.workflows_dir, workflow_id).await?;
        let (machine, sequence) = self.load_machine(&store).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _live = {
            let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
            if signals.contains_key(&workflow_id) {
                anyhow::bail!("Workflow {} is already running", workflow_id);
            }
            signals.insert(workflow_id, tx.clone());
            LiveWorkflow {
                signals: &self.signals,
                workflow_id,
            }
        };

        let mut run = WorkflowRun {
            store,
            machine,
            sequence,
            inbox: VecDeque::new(),
            tasks: JoinSet::new(),
            timers: JoinSet::new(),
            signals: tx,
        };

        self.withdraw_stale_tasks(&run)?;
        if !run.machine.is_finished() {
            for command in run.machine.outstanding_commands() {
                self.handle_command(&mut run, command).await?;
            }
            self.reconcile_deferred(&mut run)?;
        }

        loop {
            while let Ok(signal) = rx.try_recv() {
                run.inbox.push_back((SagaEvent::Signal { signal }, None));
            }
            while let Some((event, duration_ms)) = run.inbox.pop_front() {
                for command in run.record(event, duration_ms).await? {
                    self.handle_command(&mut run, command).await?;
                }
            }

            if run.machine.is_finished() {
                break;
            }
            if mode == RunMode::UntilIdle && run.tasks.is_empty() {
                info!(%workflow_id, status = %run.machine.state().status, "Workflow idle; waiting on signals");
                break;
            }

            tokio::select! {
                Some(joined) = run.tasks.join_next(), if !run.tasks.is_empty() => {
                    let result = joined.context("Workflow task panicked")?;
                    run.inbox.push_back(result);
                }
                Some(signal) = rx.recv() => {
                    run.inbox.push_back((SagaEvent::Signal { signal }, None));
                }
            }
        }

        Ok(WorkflowReport::from_state(run.machine.state(), &self.config.dashboard_url))
    }

    async fn handle_command(&self, run: &mut WorkflowRun, command: SagaCommand) -> Result<()> {
        match command {
            SagaCommand::AcquirePlan { goal } => {
                let services = Arc::clone(&self.services);
                run.tasks.spawn(async move { (acquire_plan(&services, &goal).await, None) });
            }

            SagaCommand::EvaluateGate { step_id, intent } => {
                let context = policy_context(&intent, &run.machine.state().user_id);
                let policy = match self.services.policy.evaluate(&context) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(step = %step_id, error = %e, "Policy evaluation failed; denying step");
                        PolicyOutcome::unavailable(e)
                    }
                };
                let triage = self.services.triage.triage(&intent);
                debug!(step = %step_id, decision = ?policy.decision, lane = %triage.lane, "Gate evaluated");
                if policy.lane.max(triage.lane) == RiskLane::Blocked {
                    self.audit_blocked(run.machine.state(), &step_id, &intent, &policy, &triage);
                }
                run.inbox
                    .push_back((SagaEvent::GateEvaluated { step_id, policy, triage }, None));
            }

            SagaCommand::RequestApproval {
                step_id,
                intent,
                triage,
            } => self.request_approval(run, step_id, &intent, &triage)?,

            SagaCommand::WithdrawApproval {
                step_id,
                task_id,
                reason,
            } => self.withdraw_approval(&step_id, task_id, &reason),

            SagaCommand::ExecuteActivity {
                step_id,
                tool,
                input,
                idempotency_key,
            } => {
                let activities = Arc::clone(&self.services.activities);
                run.tasks.spawn(async move {
                    let started = Instant::now();
                    let request = ActivityRequest {
                        step_id: step_id.clone(),
                        tool,
                        input,
                        idempotency_key,
                        timeout: None,
                    };
                    let event = match activities.call_activity(request).await {
                        ActivityOutcome::Completed { output, .. } => SagaEvent::ActivityCompleted { step_id, output },
                        ActivityOutcome::Failed { error, attempts } => SagaEvent::ActivityFailed {
                            step_id,
                            error,
                            attempts,
                        },
                    };
                    (event, Some(started.elapsed().as_millis() as u64))
                });
            }

            SagaCommand::Compensate {
                step_id,
                tool,
                input,
                idempotency_key,
            } => {
                let activities = Arc::clone(&self.services.activities);
                run.tasks.spawn(async move {
                    let started = Instant::now();
                    let error = match activities.call_compensation(&tool, input, &idempotency_key).await {
                        CompensationOutcome::Compensated => None,
                        CompensationOutcome::Failed { error } => {
                            error!(step = %step_id, %tool, %error, "Compensation failed");
                            Some(error)
                        }
                    };
                    (
                        SagaEvent::CompensationFinished { step_id, error },
                        Some(started.elapsed().as_millis() as u64),
                    )
                });
            }

            SagaCommand::ContinueAsNew { snapshot } => {
                run.store
                    .save_snapshot(&snapshot, run.sequence)
                    .await
                    .context("Failed to persist snapshot")?;
                run.machine = SagaMachine::from_snapshot(*snapshot, self.config.saga)?;
                info!(last_sequence = run.sequence, "Continued as new from snapshot");
            }

            SagaCommand::Finish { status } => {
                let state = run.machine.state();
                info!(
                    workflow_id = %state.workflow_id,
                    %status,
                    failure = state.failure.as_deref().unwrap_or(""),
                    "Workflow finished"
                );
                self.services.audit.record(
                    AuditRecord::new(&state.user_id, "workflow.finish", state.workflow_id.to_string(), status.as_str())
                        .with_metadata(serde_json::json!({
                            "trace_id": state.trace_id,
                            "failure": state.failure,
                            "stop_reason": state.stop_reason,
                        })),
                );
            }
        }
        Ok(())
    }

    /// Create (or find) the MAN task for a deferred step and notify approvers
    fn request_approval(
        &self,
        run: &mut WorkflowRun,
        step_id: String,
        intent: &ActionIntent,
        triage: &RiskTriageResult,
    ) -> Result<()> {
        let hours = match triage.suggested_timeout_hours {
            0 => self.config.default_approval_timeout_hours,
            hours => hours,
        };
        let expires_at = self.services.clock.now() + chrono::Duration::hours(i64::from(hours));
        let task = self
            .services
            .man_store
            .create(intent, triage, expires_at)
            .with_context(|| format!("Failed to create MAN task for step '{}'", step_id))?;

        run.inbox.push_back((
            SagaEvent::ApprovalRequested {
                step_id: step_id.clone(),
                task_id: task.task_id,
            },
            None,
        ));

        if let Some(signal) = decision_signal(&task) {
            run.inbox.push_back((SagaEvent::Signal { signal }, None));
            return Ok(());
        }

        self.services.notifications.dispatch(Notice {
            idempotency_key: format!("{}:{}:approval", run.workflow_id(), step_id),
            workflow_id: run.workflow_id(),
            task_id: task.task_id,
            step_id,
            intent: intent.clone(),
            triage: triage.clone(),
            dashboard_url: format!(
                "{}/tasks/{}",
                self.config.dashboard_url.trim_end_matches('/'),
                task.task_id
            ),
            expires_at: task.expires_at,
        });
        self.arm_expiry(run, &task);
        Ok(())
    }

    /// Close a MAN task nobody needs to decide any more
    fn withdraw_approval(&self, step_id: &str, task_id: Uuid, reason: &str) {
        match self.services.man_store.withdraw(task_id, reason) {
            Ok(task) => {
                info!(step = %step_id, %task_id, reason, "MAN task withdrawn");
                self.audit_decision(&task, "system", "man_task.withdraw");
            }
            Err(ManStoreError::InvalidTransition { from, .. }) => {
                debug!(step = %step_id, %task_id, status = %from, "MAN task already closed");
            }
            Err(e) => warn!(step = %step_id, %task_id, error = %e, "Failed to withdraw MAN task"),
        }
    }

    /// Withdraw tasks still open for cancelled steps.
    ///
    /// Covers cancels and stops that were logged while no runner was alive;
    /// their withdraw commands were dropped during replay.
    fn withdraw_stale_tasks(&self, run: &WorkflowRun) -> Result<()> {
        let state = run.machine.state();
        let cancelled = state
            .step_states
            .iter()
            .filter(|(_, step_state)| **step_state == StepState::Cancelled)
            .map(|(step_id, _)| step_id);

        for step_id in cancelled {
            let Some(task) = self.services.man_store.find_for_step(state.workflow_id, step_id)? else {
                continue;
            };
            if task.status.is_open() {
                self.withdraw_approval(step_id, task.task_id, "step cancelled");
            }
        }
        Ok(())
    }

    /// Pick up decisions recorded while the workflow was not running
    fn reconcile_deferred(&self, run: &mut WorkflowRun) -> Result<()> {
        let waiting: Vec<(String, Uuid)> = run
            .machine
            .state()
            .deferred_steps
            .iter()
            .filter_map(|(step_id, deferred)| deferred.man_task_id.map(|id| (step_id.clone(), id)))
            .collect();

        for (step_id, task_id) in waiting {
            let Some(task) = self.services.man_store.find(task_id)? else {
                warn!(step = %step_id, %task_id, "Deferred step refers to a missing MAN task");
                continue;
            };
            match decision_signal(&task) {
                Some(signal) => {
                    info!(step = %step_id, status = %task.status, "Applying stored decision");
                    run.inbox.push_back((SagaEvent::Signal { signal }, None));
                }
                None => self.arm_expiry(run, &task),
            }
        }
        Ok(())
    }

    /// Expire the task in the store and signal the workflow once its window closes
    fn arm_expiry(&self, run: &mut WorkflowRun, task: &ManTask) {
        let wait = (task.expires_at - self.services.clock.now())
            .to_std()
            .unwrap_or_default();
        let store = Arc::clone(&self.services.man_store);
        let signals = run.signals.clone();
        let task_id = task.task_id;

        run.timers.spawn(async move {
            tokio::time::sleep(wait).await;
            match store.expire(task_id) {
                Ok(_) => {
                    let _ = signals.send(Signal::Expire { task_id });
                }
                Err(ManStoreError::InvalidTransition { .. }) => {
                    debug!(%task_id, "MAN task decided before expiry");
                }
                Err(e) => warn!(%task_id, error = %e, "Failed to expire MAN task"),
            }
        });
    }
}

/// Plan from the cache when possible, otherwise from the planner
async fn acquire_plan(services: &Services, goal: &str) -> SagaEvent {
    let cache = services.plan_cache.as_ref().filter(|cache| cache.is_enabled());

    if let Some(cache) = cache {
        match cache.get_plan(goal) {
            Ok(Some(cached)) => {
                info!(template_id = %cached.template_id, similarity = cached.similarity_score, "Plan cache hit");
                let plan = Plan::cached(
                    Uuid::new_v4(),
                    cached.steps,
                    cached.template_id,
                    cached.similarity_score,
                );
                return SagaEvent::PlanResolved { plan };
            }
            Ok(None) => debug!("Plan cache miss"),
            Err(e) => warn!(error = %e, "Plan cache lookup failed; asking the planner"),
        }
    }

    match services.planner.plan(goal).await {
        Ok(steps) => {
            if let Some(cache) = cache {
                if StepGraph::build(&steps).is_ok() {
                    if let Err(e) = cache.store_plan(goal, &steps) {
                        warn!(error = %e, "Failed to cache plan");
                    }
                }
            }
            SagaEvent::PlanResolved {
                plan: Plan::generated(Uuid::new_v4(), steps),
            }
        }
        Err(e) => SagaEvent::PlanFailed {
            error: format!("{:#}", e),
        },
    }
}

/// Policy context for a step's intent
fn policy_context(intent: &ActionIntent, user_id: &str) -> PolicyContext {
    let param = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| intent.params.get(*key))
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };

    PolicyContext {
        tool: intent.tool_name.clone(),
        action: "invoke".to_string(),
        resource: param(&["resource", "table", "target"]),
        data_class: param(&["data_class"]),
        user_id: user_id.to_string(),
        source: "workflow".to_string(),
    }
}

/// Signal matching a task's recorded decision, if it has one
fn decision_signal(task: &ManTask) -> Option<Signal> {
    let actor = task
        .decision
        .as_ref()
        .map(|d| d.actor.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match task.status {
        ManTaskStatus::Approved => Some(Signal::Approve {
            task_id: task.task_id,
            approver: actor,
        }),
        ManTaskStatus::Denied => Some(Signal::Deny {
            task_id: task.task_id,
            denier: actor,
            reason: task
                .decision
                .as_ref()
                .and_then(|d| d.reason.clone())
                .unwrap_or_default(),
        }),
        ManTaskStatus::Expired => Some(Signal::Expire { task_id: task.task_id }),
        ManTaskStatus::Pending | ManTaskStatus::Escalated => None,
    }
}
