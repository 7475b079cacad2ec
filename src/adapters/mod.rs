//! Adapter interfaces for external systems.
//!
//! The orchestrator only talks to the outside world through these traits:
//! a planner that turns goals into steps, tools behind an activity layer,
//! notification channels for approvers and an audit sink.

pub mod activity;
pub mod audit;
pub mod notify;
pub mod planner;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ActionIntent, PlanStep, RiskTriageResult};

pub use activity::{ActivityError, EchoTool, RetryPolicy, ToolActivityLayer};
pub use audit::{AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use notify::{LogNotifier, Notifications, WebhookNotifier};
pub use planner::StaticPlanner;

/// Turns a goal into plan steps
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str) -> Result<Vec<PlanStep>>;
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name steps refer to in `tool` / `compensation_tool`
    fn name(&self) -> &str;

    /// Invoke the tool. The key is stable across retries of the same call.
    async fn invoke(&self, input: &serde_json::Value, idempotency_key: &str) -> Result<serde_json::Value>;
}

/// One forward activity call
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub step_id: String,
    pub tool: String,
    pub input: serde_json::Value,
    pub idempotency_key: String,

    /// Overrides the layer's default per-attempt timeout
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed { output: serde_json::Value, attempts: u32 },
    Failed { error: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Compensated,
    Failed { error: String },
}

/// Executes tools on behalf of the saga
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn call_activity(&self, request: ActivityRequest) -> ActivityOutcome;

    async fn call_compensation(
        &self,
        tool: &str,
        input: serde_json::Value,
        idempotency_key: &str,
    ) -> CompensationOutcome;
}

/// Approval request sent to humans.
///
/// Carries the whole intent and triage result so approvers see the exact
/// parameters and risk factors they are signing off on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    /// Deduplication key; one delivery per key
    pub idempotency_key: String,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub step_id: String,
    pub intent: ActionIntent,
    pub triage: RiskTriageResult,
    pub dashboard_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of one delivery attempt on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: String,
    pub delivered: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            delivered: true,
            error: None,
        }
    }

    pub fn failed(channel: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            delivered: false,
            error: Some(error.into()),
        }
    }
}

/// A notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Vec<DeliveryResult>;
}
