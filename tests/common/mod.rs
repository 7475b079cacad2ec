//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sagaflow::adapters::{
    AuditSink, DeliveryResult, MemoryAuditSink, Notice, Notifications, Notifier, Planner, RetryPolicy, Tool,
    ToolActivityLayer,
};
use sagaflow::core::{
    ManTaskStore, ManualClock, Orchestrator, OrchestratorConfig, PlanCacheConfig, PolicyEvaluator, PolicyRule,
    RiskTriageEngine, SemanticPlanCache, Services, StaticPolicySource, TemplateStore, TriageConfig,
};
use sagaflow::domain::{PlanStep, WorkflowReport};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Every tool invocation, in call order
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, tool: &str) {
        self.0.lock().unwrap().push(tool.to_string());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, tool: &str) -> usize {
        self.all().iter().filter(|t| *t == tool).count()
    }
}

/// Records each call; fails every call when `fail` is set
pub struct RecordingTool {
    name: String,
    calls: CallLog,
    fail: bool,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &serde_json::Value, idempotency_key: &str) -> Result<serde_json::Value> {
        self.calls.record(&self.name);
        if self.fail {
            anyhow::bail!("{} is down", self.name);
        }
        Ok(json!({ "tool": self.name, "key": idempotency_key, "input": input }))
    }
}

/// Serves fixed steps and counts how often it was asked
pub struct CountingPlanner {
    steps: Vec<PlanStep>,
    calls: AtomicUsize,
}

impl CountingPlanner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for CountingPlanner {
    async fn plan(&self, _goal: &str) -> Result<Vec<PlanStep>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.steps.clone())
    }
}

/// Forwards notices to a channel
pub struct ChannelNotifier(pub mpsc::UnboundedSender<Notice>);

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notice: &Notice) -> Vec<DeliveryResult> {
        let _ = self.0.send(notice.clone());
        vec![DeliveryResult::delivered("test")]
    }
}

pub struct HarnessBuilder {
    steps: Vec<PlanStep>,
    rules: Vec<PolicyRule>,
    failing: Vec<String>,
    plan_cache: bool,
    config: OrchestratorConfig,
}

impl HarnessBuilder {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            rules: Vec::new(),
            failing: Vec::new(),
            plan_cache: false,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn rules(mut self, rules: Vec<PolicyRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Tools that fail every call
    pub fn failing(mut self, tools: &[&str]) -> Self {
        self.failing = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn plan_cache(mut self) -> Self {
        self.plan_cache = true;
        self
    }

    pub fn history_threshold(mut self, threshold: u64) -> Self {
        self.config.saga.history_threshold = threshold;
        self
    }

    pub fn build(self) -> Harness {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let calls = CallLog::default();

        let mut layer = ToolActivityLayer::new(RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            timeout_seconds: 5,
        });
        for step in &self.steps {
            for name in std::iter::once(&step.tool).chain(step.compensation_tool.as_ref()) {
                layer.register(Arc::new(RecordingTool {
                    name: name.clone(),
                    calls: calls.clone(),
                    fail: self.failing.contains(name),
                }));
            }
        }

        let db_path = temp.path().join("sagaflow.db");
        let audit = Arc::new(MemoryAuditSink::new());
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let plan_cache = self.plan_cache.then(|| {
            Arc::new(SemanticPlanCache::with_clock(
                TemplateStore::open(&db_path).unwrap(),
                PlanCacheConfig::default(),
                clock.clone(),
            ))
        });

        Harness {
            planner: Arc::new(CountingPlanner {
                steps: self.steps,
                calls: AtomicUsize::new(0),
            }),
            activities: Arc::new(layer),
            rules: self.rules,
            man_store: Arc::new(ManTaskStore::open_with_clock(&db_path, clock.clone()).unwrap()),
            plan_cache,
            notifications: Arc::new(Notifications::new(vec![Arc::new(ChannelNotifier(notice_tx))])),
            notices: tokio::sync::Mutex::new(notices),
            audit,
            clock,
            calls,
            config: self.config,
            temp,
        }
    }
}

pub struct Harness {
    pub planner: Arc<CountingPlanner>,
    pub activities: Arc<ToolActivityLayer>,
    pub man_store: Arc<ManTaskStore>,
    pub plan_cache: Option<Arc<SemanticPlanCache>>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
    pub calls: CallLog,
    pub temp: TempDir,
    rules: Vec<PolicyRule>,
    notifications: Arc<Notifications>,
    notices: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notice>>,
    config: OrchestratorConfig,
}

impl Harness {
    /// A fresh orchestrator over the shared stores, as after a process restart
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        let audit: Arc<dyn AuditSink> = self.audit.clone();
        let policy = PolicyEvaluator::with_clock(
            Arc::new(StaticPolicySource::new(self.rules.clone())),
            audit.clone(),
            chrono::Duration::seconds(60),
            self.clock.clone(),
        );
        // Unknown tools land in YELLOW; only RED needs a human here
        let triage = RiskTriageEngine::new(&TriageConfig {
            yellow_requires_approval: false,
            ..TriageConfig::default()
        });

        let mut services = Services::new(
            self.planner.clone(),
            self.activities.clone(),
            Arc::new(policy),
            self.man_store.clone(),
            audit,
        )
        .with_triage(triage)
        .with_notifications(self.notifications.clone())
        .with_clock(self.clock.clone());
        if let Some(cache) = &self.plan_cache {
            services = services.with_plan_cache(cache.clone());
        }

        Arc::new(Orchestrator::new(
            services,
            self.config.clone(),
            self.temp.path().join("workflows"),
        ))
    }

    /// Next approval notice, waiting briefly for the background delivery
    pub async fn next_notice(&self) -> Notice {
        let mut notices = self.notices.lock().await;
        tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("no notice delivered")
            .expect("notice channel closed")
    }

    /// Wait until a MAN task exists for a workflow
    pub async fn wait_for_task(&self, workflow_id: Uuid) -> Uuid {
        for _ in 0..500 {
            let pending = self.man_store.list_pending().unwrap();
            if let Some(task) = pending.iter().find(|t| t.workflow_id == workflow_id) {
                return task.task_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no MAN task created for {}", workflow_id);
    }

    /// Wait until any MAN task is pending
    pub async fn wait_for_any_task(&self) -> Uuid {
        for _ in 0..500 {
            if let Some(task) = self.man_store.list_pending().unwrap().first() {
                return task.task_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no MAN task created");
    }
}

pub fn step(id: &str, tool: &str, deps: &[&str]) -> PlanStep {
    PlanStep::new(id, tool, json!({ "id": id })).depends_on(deps.iter().copied())
}

pub fn state_label(report: &WorkflowReport, step_id: &str) -> &'static str {
    report.step(step_id).unwrap().state.label()
}
