//! Command-line interface for sagaflow.
//!
//! Provides commands for running goals against a hand-written plan, checking
//! and resuming workflows, deciding MAN tasks and poking at the triage engine
//! and plan cache.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{
    AuditSink, EchoTool, JsonlAuditSink, LogNotifier, Notifications, Notifier, Planner, StaticPlanner,
    ToolActivityLayer, WebhookNotifier,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    ManTaskStore, Orchestrator, PolicyEvaluator, RiskTriageEngine, RunMode, SemanticPlanCache, Services,
    TemplateStore, YamlPolicySource,
};
use crate::domain::{ActionIntent, ManTask, PlanStep, WorkflowReport};

/// sagaflow - Saga orchestrator with policy gates and human approvals
#[derive(Parser, Debug)]
#[command(name = "sagaflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a goal against a YAML plan with dry-run tools
    Run {
        /// Goal text
        goal: String,

        /// Plan file served by the planner
        #[arg(short, long)]
        plan: PathBuf,

        /// Submitting user
        #[arg(short, long, env = "USER", default_value = "cli")]
        user: String,

        /// Correlation id carried on the workflow's events and audit records
        #[arg(long, env = "SAGAFLOW_TRACE_ID")]
        trace_id: Option<String>,

        /// Keep waiting for approvals instead of returning when idle
        #[arg(long)]
        wait: bool,
    },

    /// Resume a workflow from its snapshot and event log
    Resume {
        /// Workflow ID
        workflow_id: String,

        /// Lift a pause before resuming
        #[arg(long)]
        unpause: bool,

        #[arg(long)]
        wait: bool,
    },

    /// Show a workflow, or list all workflows
    Status {
        /// Workflow ID (lists workflows if omitted)
        workflow_id: Option<String>,
    },

    /// List MAN tasks waiting for a decision
    Tasks,

    /// Approve a MAN task
    Approve {
        task_id: String,

        #[arg(long, env = "USER", default_value = "cli")]
        approver: String,
    },

    /// Deny a MAN task
    Deny {
        task_id: String,

        #[arg(long)]
        reason: String,

        #[arg(long, env = "USER", default_value = "cli")]
        denier: String,
    },

    /// Escalate a PENDING MAN task; it stays open for a decision
    Escalate {
        task_id: String,

        #[arg(long, env = "USER", default_value = "cli")]
        actor: String,
    },

    /// Expire MAN tasks past their deadline
    Expire,

    /// Pause dispatching new steps
    Pause { workflow_id: String },

    /// Stop a workflow; running steps drain
    Stop {
        workflow_id: String,

        #[arg(long, default_value = "stopped from cli")]
        reason: String,
    },

    /// Cancel one step that has not started
    CancelStep { workflow_id: String, step_id: String },

    /// Classify a tool call into a risk lane
    Triage {
        /// Tool name
        tool: String,

        /// Parameters as key=value (values parsed as JSON when possible)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        #[arg(long)]
        irreversible: bool,
    },

    /// Look a goal up in the plan cache
    CacheLookup { goal: String },

    /// Show current configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                goal,
                plan,
                user,
                trace_id,
                wait,
            } => {
                let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                run_goal(&goal, plan, &user, &trace_id, wait).await
            }
            Commands::Resume {
                workflow_id,
                unpause,
                wait,
            } => resume_workflow(&workflow_id, unpause, wait).await,
            Commands::Status { workflow_id } => match workflow_id {
                Some(id) => show_status(&id).await,
                None => list_workflows().await,
            },
            Commands::Tasks => list_tasks(),
            Commands::Approve { task_id, approver } => {
                let task = control_orchestrator()?.approve(parse_id(&task_id)?, &approver)?;
                print_task_decision(&task);
                Ok(())
            }
            Commands::Deny {
                task_id,
                reason,
                denier,
            } => {
                let task = control_orchestrator()?.deny(parse_id(&task_id)?, &denier, &reason)?;
                print_task_decision(&task);
                Ok(())
            }
            Commands::Escalate { task_id, actor } => {
                let task = control_orchestrator()?.escalate(parse_id(&task_id)?, &actor)?;
                print_task_decision(&task);
                Ok(())
            }
            Commands::Expire => {
                let expired = control_orchestrator()?.expire_overdue()?;
                println!("Expired {} task(s)", expired.len());
                for task in expired {
                    println!("  {} (workflow {}, step {})", task.task_id, task.workflow_id, task.step_id);
                }
                Ok(())
            }
            Commands::Pause { workflow_id } => control_orchestrator()?.pause(parse_id(&workflow_id)?).await,
            Commands::Stop { workflow_id, reason } => {
                control_orchestrator()?
                    .stop(parse_id(&workflow_id)?, &reason)
                    .await
            }
            Commands::CancelStep { workflow_id, step_id } => {
                control_orchestrator()?
                    .cancel_step(parse_id(&workflow_id)?, &step_id)
                    .await
            }
            Commands::Triage {
                tool,
                params,
                irreversible,
            } => triage(&tool, params, irreversible),
            Commands::CacheLookup { goal } => cache_lookup(&goal),
            Commands::Config => show_config(),
        }
    }
}

/// Parse a `key=value` parameter
fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid ID: {}", raw))
}

/// Dry-run tools for every tool and compensation a plan names
fn dry_run_tools(cfg: &ResolvedConfig, steps: &[PlanStep]) -> ToolActivityLayer {
    let mut layer = ToolActivityLayer::new(cfg.retry.clone());
    for step in steps {
        for name in std::iter::once(&step.tool).chain(step.compensation_tool.as_ref()) {
            if !layer.has_tool(name) {
                layer.register(Arc::new(EchoTool::new(name)));
            }
        }
    }
    layer
}

/// Wire the configured services around a planner and activity layer
fn build_orchestrator(
    cfg: &ResolvedConfig,
    planner: Arc<dyn Planner>,
    activities: ToolActivityLayer,
) -> Result<Orchestrator> {
    let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(cfg.audit_log_path()));
    let policy = PolicyEvaluator::new(
        Arc::new(YamlPolicySource::new(&cfg.policy_file)),
        Arc::clone(&audit),
        chrono::Duration::seconds(cfg.policy_ttl_seconds as i64),
    );
    let man_store = ManTaskStore::open(&cfg.database_path()).context("Failed to open MAN task store")?;

    let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();
    if cfg.notifications.log {
        channels.push(Arc::new(LogNotifier));
    }
    if let Some(url) = &cfg.notifications.webhook_url {
        channels.push(Arc::new(WebhookNotifier::new(url)));
    }

    let mut services = Services::new(
        planner,
        Arc::new(activities),
        Arc::new(policy),
        Arc::new(man_store),
        audit,
    )
    .with_triage(RiskTriageEngine::new(&cfg.triage))
    .with_notifications(Arc::new(Notifications::new(channels)));

    if cfg.plan_cache.enabled {
        let store = TemplateStore::open(&cfg.database_path()).context("Failed to open plan cache")?;
        services = services.with_plan_cache(Arc::new(SemanticPlanCache::new(store, cfg.plan_cache.clone())));
    }

    Ok(Orchestrator::new(services, cfg.orchestrator.clone(), cfg.workflows_dir()))
}

/// Orchestrator for commands that never run tools
fn control_orchestrator() -> Result<Orchestrator> {
    let cfg = config::config()?;
    build_orchestrator(cfg, Arc::new(StaticPlanner::new(Vec::new())), dry_run_tools(cfg, &[]))
}

fn run_mode(wait: bool) -> RunMode {
    if wait {
        RunMode::UntilFinished
    } else {
        RunMode::UntilIdle
    }
}

async fn run_goal(goal: &str, plan: PathBuf, user: &str, trace_id: &str, wait: bool) -> Result<()> {
    let cfg = config::config()?;
    let planner = StaticPlanner::from_file(&plan)?;
    let tools = dry_run_tools(cfg, planner.steps());
    let orchestrator = build_orchestrator(cfg, Arc::new(planner), tools)?;

    let report = orchestrator.run_workflow(goal, user, trace_id, run_mode(wait)).await?;
    print_report(&report);
    Ok(())
}

async fn resume_workflow(workflow_id: &str, unpause: bool, wait: bool) -> Result<()> {
    let cfg = config::config()?;
    let workflow_id = parse_id(workflow_id)?;

    let state = control_orchestrator()?.load_state(workflow_id).await?;
    let steps = state.plan.as_ref().map(|p| p.steps.as_slice()).unwrap_or_default();
    let orchestrator = build_orchestrator(cfg, Arc::new(StaticPlanner::new(steps.to_vec())), dry_run_tools(cfg, steps))?;

    if unpause {
        orchestrator.resume(workflow_id).await?;
    }
    let report = orchestrator.resume_workflow(workflow_id, run_mode(wait)).await?;
    print_report(&report);
    Ok(())
}

async fn show_status(workflow_id: &str) -> Result<()> {
    let report = control_orchestrator()?.workflow_status(parse_id(workflow_id)?).await?;
    print_report(&report);
    Ok(())
}

async fn list_workflows() -> Result<()> {
    let orchestrator = control_orchestrator()?;
    let ids = orchestrator.list_workflows().await?;

    if ids.is_empty() {
        println!("No workflows found");
        return Ok(());
    }

    println!("{:<38} {:<14} {:<6}", "WORKFLOW ID", "STATUS", "STEPS");
    println!("{}", "-".repeat(60));
    for id in ids {
        match orchestrator.workflow_status(id).await {
            Ok(report) => println!("{:<38} {:<14} {:<6}", id, report.status, report.steps.len()),
            Err(e) => println!("{:<38} {:<14} {}", id, "unreadable", e),
        }
    }
    Ok(())
}

fn list_tasks() -> Result<()> {
    let cfg = config::config()?;
    let store = ManTaskStore::open(&cfg.database_path())?;
    let tasks = store.list_pending()?;

    if tasks.is_empty() {
        println!("No tasks waiting for a decision");
        return Ok(());
    }

    println!("{:<38} {:<18} {:<8} {:<10} {}", "TASK ID", "TOOL", "LANE", "STATUS", "EXPIRES");
    println!("{}", "-".repeat(100));
    for task in tasks {
        println!(
            "{:<38} {:<18} {:<8} {:<10} {}",
            task.task_id,
            task.intent.tool_name,
            task.triage.lane,
            task.status,
            task.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

fn triage(tool: &str, params: Vec<(String, serde_json::Value)>, irreversible: bool) -> Result<()> {
    let cfg = config::config()?;
    let engine = RiskTriageEngine::new(&cfg.triage);
    let params: BTreeMap<String, serde_json::Value> = params.into_iter().collect();
    let intent = ActionIntent::new(tool, params, Uuid::nil(), "cli").irreversible(irreversible);

    let result = engine.triage(&intent);
    println!("Lane:              {}", result.lane);
    println!("Reason:            {}", result.reason);
    println!("Risk factors:      {}", result.risk_factors.join(", "));
    println!("Requires approval: {}", result.requires_approval);
    if result.requires_approval {
        println!("Approval window:   {}h", result.suggested_timeout_hours);
    }
    Ok(())
}

fn cache_lookup(goal: &str) -> Result<()> {
    let cfg = config::config()?;
    let store = TemplateStore::open(&cfg.database_path())?;
    let cache = SemanticPlanCache::new(store, cfg.plan_cache.clone());

    match cache.get_plan(goal)? {
        Some(cached) => {
            println!("Cache hit: template {} (similarity {:.3})", cached.template_id, cached.similarity_score);
            println!("{}", serde_json::to_string_pretty(&cached.steps)?);
        }
        None => println!("Cache miss"),
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("sagaflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Workflows:   {}", cfg.workflows_dir().display());
    println!("  Database:    {}", cfg.database_path().display());
    println!("  Audit log:   {}", cfg.audit_log_path().display());
    println!("  Policies:    {} (ttl {}s)", cfg.policy_file.display(), cfg.policy_ttl_seconds);
    println!();
    println!("Orchestrator:");
    println!("  Max concurrency:   {}", cfg.orchestrator.saga.max_concurrency);
    println!("  History threshold: {}", cfg.orchestrator.saga.history_threshold);
    println!("  Dashboard:         {}", cfg.orchestrator.dashboard_url);
    println!();
    println!("Plan cache:");
    println!("  Enabled:   {}", cfg.plan_cache.enabled);
    println!("  Threshold: {}", cfg.plan_cache.similarity_threshold);
    println!("  TTL:       {}h", cfg.plan_cache.ttl_hours);
    println!();
    println!("Retry:");
    println!("  Max attempts: {}", cfg.retry.max_attempts);
    println!("  Timeout:      {}s", cfg.retry.timeout_seconds);
    println!();
    println!(
        "Webhook: {}",
        cfg.notifications.webhook_url.as_deref().unwrap_or("(none)")
    );

    Ok(())
}

fn print_report(report: &WorkflowReport) {
    println!("Workflow: {}", report.workflow_id);
    println!("Status:   {}", report.status);
    if report.cache_hit {
        println!("Plan:     from cache");
    }
    if let Some(failure) = &report.failure {
        println!("Failure:  {}", failure);
    }
    if let Some(reason) = &report.stop_reason {
        println!("Stopped:  {}", reason);
    }

    if report.steps.is_empty() {
        return;
    }
    println!("\nSteps:");
    for step in &report.steps {
        let detail = match &step.dashboard_url {
            Some(url) => format!("approve at {}", url),
            None => String::new(),
        };
        println!("  {:<20} {:<18} {:<10} {}", step.step_id, step.tool, step.state.label(), detail);
    }
}

fn print_task_decision(task: &ManTask) {
    println!("Task {} is now {}", task.task_id, task.status);
    println!("  Workflow: {}", task.workflow_id);
    println!("  Step:     {}", task.step_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("amount=1500").unwrap(), ("amount".to_string(), json!(1500)));
        assert_eq!(parse_param("force=true").unwrap(), ("force".to_string(), json!(true)));
        assert_eq!(parse_param("table=users").unwrap(), ("table".to_string(), json!("users")));
        assert!(parse_param("no-equals").is_err());
    }

    #[test]
    fn test_cli_parses_triage() {
        let cli = Cli::parse_from(["sagaflow", "triage", "transfer_funds", "-p", "amount=5000", "--irreversible"]);
        match cli.command {
            Commands::Triage {
                tool,
                params,
                irreversible,
            } => {
                assert_eq!(tool, "transfer_funds");
                assert_eq!(params.len(), 1);
                assert!(irreversible);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_run_trace_id() {
        let cli = Cli::parse_from(["sagaflow", "run", "read record 1", "--plan", "plan.yaml", "--trace-id", "abc-123"]);
        match cli.command {
            Commands::Run { goal, trace_id, wait, .. } => {
                assert_eq!(goal, "read record 1");
                assert_eq!(trace_id.as_deref(), Some("abc-123"));
                assert!(!wait);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_escalate() {
        let task_id = Uuid::new_v4().to_string();
        let cli = Cli::parse_from(["sagaflow", "escalate", task_id.as_str(), "--actor", "oncall"]);
        match cli.command {
            Commands::Escalate { task_id: parsed, actor } => {
                assert_eq!(parsed, task_id);
                assert_eq!(actor, "oncall");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
