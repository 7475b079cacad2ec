//! Configuration for sagaflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SAGAFLOW_HOME, SAGAFLOW_POLICY_FILE, SAGAFLOW_WEBHOOK_URL)
//! 2. Config file (.sagaflow/config.yaml)
//! 3. Defaults (~/.sagaflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sagaflow/config.yaml
//! - Paths in config file are relative to the .sagaflow/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::RetryPolicy;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::plan_cache::PlanCacheConfig;
use crate::core::triage::TriageConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub plan_cache: PlanCacheConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .sagaflow/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy rules file (relative to .sagaflow/)
    #[serde(default)]
    pub file: Option<String>,

    /// How long loaded rules are served before a reload
    #[serde(default = "default_policy_ttl")]
    pub ttl_seconds: u64,
}

fn default_policy_ttl() -> u64 {
    60
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            file: None,
            ttl_seconds: default_policy_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Also write approval notices to the log
    #[serde(default = "default_log_notices")]
    pub log: bool,
}

fn default_log_notices() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            log: default_log_notices(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (workflows, database, audit log)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub policy_file: PathBuf,
    pub policy_ttl_seconds: u64,
    pub triage: TriageConfig,
    pub plan_cache: PlanCacheConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub notifications: NotificationsConfig,
}

impl ResolvedConfig {
    /// Per-workflow event logs and snapshots
    pub fn workflows_dir(&self) -> PathBuf {
        self.home.join("workflows")
    }

    /// SQLite database for MAN tasks and plan templates
    pub fn database_path(&self) -> PathBuf {
        self.home.join("sagaflow.db")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.home.join("audit.jsonl")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".sagaflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path).canonicalize().unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a config file (if any) with environment overrides
fn resolve(
    config_file: Option<PathBuf>,
    env: &dyn Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let config = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let config_dir = config_file.as_deref().and_then(Path::parent);

    let home = match (env("SAGAFLOW_HOME"), &config.paths.home, config_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let policy_file = match (env("SAGAFLOW_POLICY_FILE"), &config.policy.file, config_dir) {
        (Some(file), _, _) => PathBuf::from(file),
        (None, Some(file), Some(dir)) => resolve_path(dir, file),
        _ => home.join("policies.yaml"),
    };

    let mut notifications = config.notifications;
    if let Some(url) = env("SAGAFLOW_WEBHOOK_URL") {
        notifications.webhook_url = Some(url);
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        policy_file,
        policy_ttl_seconds: config.policy.ttl_seconds,
        triage: config.triage,
        plan_cache: config.plan_cache,
        orchestrator: config.orchestrator,
        retry: config.retry,
        notifications,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sagaflow");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(find_config_file(&cwd), &|key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the sagaflow home directory
pub fn sagaflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
