//! Policy evaluation with a TTL-cached rule set.
//!
//! Rules come from a [`PolicySource`] and are cached in memory; the backing
//! store is read at most once per TTL window no matter how many evaluations
//! run concurrently. Matching is a bounded allow-list comparison per field:
//! no patterns, no expressions.
//!
//! Example policy file:
//!
//! ```yaml
//! policies:
//!   - name: no_prod_deletes
//!     version: 2
//!     priority: 10
//!     decision: DENY
//!     lane: BLOCKED
//!     match:
//!       tool: [delete_record]
//!       resource: [prod]
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::audit::{AuditRecord, AuditSink};
use crate::domain::{PolicyContext, PolicyDecision, PolicyOutcome, RiskLane};

use super::clock::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Policy store unavailable: {0}")]
    Unavailable(String),
}

/// One policy row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Lower runs first
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub decision: PolicyDecision,

    #[serde(default = "default_lane")]
    pub lane: RiskLane,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default, rename = "match")]
    pub matcher: PolicyMatch,
}

fn default_version() -> u32 {
    1
}
fn default_enabled() -> bool {
    true
}
fn default_lane() -> RiskLane {
    RiskLane::Green
}

/// Allowed values per field; a missing list matches anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatch {
    #[serde(default)]
    pub tool: Option<Vec<String>>,
    #[serde(default)]
    pub action: Option<Vec<String>>,
    #[serde(default)]
    pub resource: Option<Vec<String>>,
    #[serde(default)]
    pub data_class: Option<Vec<String>>,
}

impl PolicyMatch {
    fn normalize(&mut self) {
        for list in [&mut self.tool, &mut self.action, &mut self.resource, &mut self.data_class]
            .into_iter()
            .flatten()
        {
            for value in list.iter_mut() {
                *value = value.trim().to_lowercase();
            }
        }
    }

    /// Values must already be normalised
    fn matches(&self, ctx: &NormalizedContext) -> bool {
        field_matches(&self.tool, &ctx.tool)
            && field_matches(&self.action, &ctx.action)
            && field_matches(&self.resource, &ctx.resource)
            && field_matches(&self.data_class, &ctx.data_class)
    }
}

fn field_matches(allowed: &Option<Vec<String>>, value: &str) -> bool {
    match allowed {
        None => true,
        Some(list) => list.iter().any(|v| v == value),
    }
}

struct NormalizedContext {
    tool: String,
    action: String,
    resource: String,
    data_class: String,
}

impl NormalizedContext {
    fn new(ctx: &PolicyContext) -> Self {
        Self {
            tool: ctx.tool.trim().to_lowercase(),
            action: ctx.action.trim().to_lowercase(),
            resource: ctx.resource.trim().to_lowercase(),
            data_class: ctx.data_class.trim().to_lowercase(),
        }
    }
}

/// Backing store for policy rows
pub trait PolicySource: Send + Sync {
    fn load(&self) -> Result<Vec<PolicyRule>, PolicyError>;
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyRule>,
}

/// Policies read from a YAML file. A missing file means "no policies".
#[derive(Debug, Clone)]
pub struct YamlPolicySource {
    path: PathBuf,
}

impl YamlPolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicySource for YamlPolicySource {
    fn load(&self) -> Result<Vec<PolicyRule>, PolicyError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| PolicyError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let file: PolicyFile = serde_yaml::from_str(&content).map_err(|source| PolicyError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(file.policies)
    }
}

/// Fixed in-memory rule set
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    rules: Vec<PolicyRule>,
}

impl StaticPolicySource {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }
}

impl PolicySource for StaticPolicySource {
    fn load(&self) -> Result<Vec<PolicyRule>, PolicyError> {
        Ok(self.rules.clone())
    }
}

struct CachedPolicies {
    rules: Vec<PolicyRule>,
    loaded_at: DateTime<Utc>,
}

/// Deterministic first-match policy evaluator
pub struct PolicyEvaluator {
    source: Arc<dyn PolicySource>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<Option<Arc<CachedPolicies>>>,
    refresh: Mutex<()>,
}

impl PolicyEvaluator {
    pub fn new(source: Arc<dyn PolicySource>, audit: Arc<dyn AuditSink>, ttl: Duration) -> Self {
        Self::with_clock(source, audit, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn PolicySource>,
        audit: Arc<dyn AuditSink>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            audit,
            clock,
            ttl,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Evaluate a context against the cached rules
    pub fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyOutcome, PolicyError> {
        let cached = self.rules()?;
        let normalized = NormalizedContext::new(ctx);

        let outcome = cached
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(&normalized))
            .map(|rule| PolicyOutcome {
                decision: rule.decision,
                lane: rule.lane,
                reason: rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("matched policy {}", rule.name)),
                policy_name: rule.name.clone(),
                policy_version: rule.version,
            })
            .unwrap_or_else(PolicyOutcome::default_allow);

        debug!(
            tool = %ctx.tool,
            decision = %outcome.decision,
            policy = %outcome.policy_name,
            "Policy evaluated"
        );
        self.audit_decision(ctx, &outcome);

        Ok(outcome)
    }

    /// Drop the cached rules so the next evaluation reloads them
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn fresh(&self, cached: &Option<Arc<CachedPolicies>>) -> Option<Arc<CachedPolicies>> {
        cached
            .as_ref()
            .filter(|c| self.clock.now() - c.loaded_at < self.ttl)
            .cloned()
    }

    fn rules(&self) -> Result<Arc<CachedPolicies>, PolicyError> {
        if let Some(cached) = self.fresh(&self.cache.read().unwrap_or_else(|e| e.into_inner())) {
            return Ok(cached);
        }

        // Single writer: whoever gets here second finds the cache refreshed
        let _guard = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.cache.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cached) = self.fresh(&current) {
            return Ok(cached);
        }

        let now = self.clock.now();
        let refreshed = match self.source.load() {
            Ok(rules) => Arc::new(CachedPolicies {
                rules: prepare(rules),
                loaded_at: now,
            }),
            Err(e) => match current {
                Some(stale) => {
                    warn!(error = %e, "Policy refresh failed, serving previous rules");
                    Arc::new(CachedPolicies {
                        rules: stale.rules.clone(),
                        loaded_at: now,
                    })
                }
                None => return Err(e),
            },
        };

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(refreshed.clone());
        Ok(refreshed)
    }

    fn audit_decision(&self, ctx: &PolicyContext, outcome: &PolicyOutcome) {
        let record = AuditRecord::new(
            ctx.user_id.clone(),
            "policy.evaluate",
            ctx.tool.clone(),
            outcome.decision.as_str(),
        )
        .with_metadata(serde_json::json!({
            "context_hash": hash_context(ctx),
            "policy_name": outcome.policy_name,
            "policy_version": outcome.policy_version,
            "lane": outcome.lane,
            "source": ctx.source,
        }));
        self.audit.record(record);
    }
}

/// Keep enabled rules, normalise match values, sort deterministically
fn prepare(rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    let mut rules: Vec<PolicyRule> = rules
        .into_iter()
        .filter(|r| r.enabled)
        .map(|mut r| {
            r.matcher.normalize();
            r
        })
        .collect();
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| b.version.cmp(&a.version))
    });
    rules
}

/// SHA-256 of the serialized context; the raw context never reaches the audit log
pub fn hash_context(ctx: &PolicyContext) -> String {
    let bytes = serde_json::to_vec(ctx).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
