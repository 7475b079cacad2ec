//! Activity layer: runs tools with retries, timeouts and an idempotency ledger.
//!
//! A key is executed at most once per layer. Concurrent or later calls with
//! the same key wait for, and then return, the recorded outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{ActivityExecutor, ActivityOutcome, ActivityRequest, CompensationOutcome, Tool};

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' timed out after {after_ms}ms")]
    Timeout { tool: String, after_ms: u64 },

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },
}

/// Retry policy for activities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_timeout_seconds() -> u64 {
    300
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

type Ledger = Mutex<HashMap<String, Arc<OnceCell<ActivityOutcome>>>>;

/// Tool registry plus retry, timeout and deduplication
pub struct ToolActivityLayer {
    tools: HashMap<String, Arc<dyn Tool>>,
    retry: RetryPolicy,
    ledger: Ledger,
}

impl ToolActivityLayer {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            tools: HashMap::new(),
            retry,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool under its own name
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    fn ledger_slot(&self, key: &str) -> Arc<OnceCell<ActivityOutcome>> {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.entry(key.to_string()).or_default().clone()
    }

    /// Run a tool with retries; never called twice for the same key
    async fn run_with_retry(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        key: &str,
        timeout: Duration,
    ) -> ActivityOutcome {
        let Some(tool) = self.tools.get(tool_name) else {
            return ActivityOutcome::Failed {
                error: ActivityError::UnknownTool(tool_name.to_string()).to_string(),
                attempts: 0,
            };
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();

            let result = match tokio::time::timeout(timeout, tool.invoke(input, key)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(ActivityError::Tool {
                    tool: tool_name.to_string(),
                    message: format!("{:#}", e),
                }),
                Err(_) => Err(ActivityError::Timeout {
                    tool: tool_name.to_string(),
                    after_ms: timeout.as_millis() as u64,
                }),
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(output) => {
                    debug!(tool = tool_name, key, attempt, duration_ms, "Tool call succeeded");
                    return ActivityOutcome::Completed {
                        output,
                        attempts: attempt,
                    };
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        tool = tool_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Tool call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(tool = tool_name, attempt, error = %e, "Tool call failed, giving up");
                    return ActivityOutcome::Failed {
                        error: e.to_string(),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[async_trait]
impl ActivityExecutor for ToolActivityLayer {
    async fn call_activity(&self, request: ActivityRequest) -> ActivityOutcome {
        let slot = self.ledger_slot(&request.idempotency_key);
        if let Some(outcome) = slot.get() {
            info!(key = %request.idempotency_key, "Duplicate activity call; returning recorded outcome");
            return outcome.clone();
        }

        let timeout = request.timeout.unwrap_or_else(|| self.retry.timeout());
        slot.get_or_init(|| self.run_with_retry(&request.tool, &request.input, &request.idempotency_key, timeout))
            .await
            .clone()
    }

    async fn call_compensation(
        &self,
        tool: &str,
        input: serde_json::Value,
        idempotency_key: &str,
    ) -> CompensationOutcome {
        let slot = self.ledger_slot(idempotency_key);
        let outcome = slot
            .get_or_init(|| self.run_with_retry(tool, &input, idempotency_key, self.retry.timeout()))
            .await;

        match outcome {
            ActivityOutcome::Completed { .. } => CompensationOutcome::Compensated,
            ActivityOutcome::Failed { error, .. } => CompensationOutcome::Failed { error: error.clone() },
        }
    }
}

/// Dry-run tool: echoes its input back without side effects
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &serde_json::Value, idempotency_key: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "tool": self.name,
            "dry_run": true,
            "idempotency_key": idempotency_key,
            "input": input,
        }))
    }
}
