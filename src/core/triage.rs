//! Risk triage: classify an action intent into a risk lane.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. intent marked irreversible -> RED
//! 2. blocked tool -> BLOCKED (never runs, not even with approval)
//! 3. sensitive tool -> RED
//! 4. safe tool -> GREEN
//! 5. risky parameters -> YELLOW for one signal, RED for two or more
//! 6. anything else -> YELLOW (unknown tool)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::{ActionIntent, RiskLane, RiskTriageResult};

/// Tool lists and thresholds for triage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Tools that must never run
    #[serde(default = "default_blocked_tools")]
    pub blocked_tools: Vec<String>,

    /// Tools that always need a human sign-off
    #[serde(default = "default_sensitive_tools")]
    pub sensitive_tools: Vec<String>,

    /// Tools that run without review
    #[serde(default = "default_safe_tools")]
    pub safe_tools: Vec<String>,

    /// Boolean-ish parameters that make a call risky when truthy
    #[serde(default = "default_risky_flags")]
    pub risky_flags: Vec<String>,

    /// Parameters holding monetary amounts
    #[serde(default = "default_amount_params")]
    pub amount_params: Vec<String>,

    /// Amounts at or above this are a risk signal
    #[serde(default = "default_amount_threshold")]
    pub amount_threshold: f64,

    /// Whether YELLOW results need approval
    #[serde(default = "default_yellow_requires_approval")]
    pub yellow_requires_approval: bool,

    #[serde(default = "default_red_timeout_hours")]
    pub red_timeout_hours: u32,

    #[serde(default = "default_yellow_timeout_hours")]
    pub yellow_timeout_hours: u32,
}

fn default_blocked_tools() -> Vec<String> {
    ["drop_database", "drop_table", "shell_exec", "truncate_table"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sensitive_tools() -> Vec<String> {
    [
        "delete_record",
        "update_record",
        "send_email",
        "send_webhook",
        "transfer_funds",
        "actuate_device",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_safe_tools() -> Vec<String> {
    ["search", "web_search", "read_record", "list_records", "get_weather", "echo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_risky_flags() -> Vec<String> {
    vec!["force".to_string(), "cascade".to_string()]
}

fn default_amount_params() -> Vec<String> {
    vec!["amount".to_string()]
}

fn default_amount_threshold() -> f64 {
    1000.0
}
fn default_yellow_requires_approval() -> bool {
    true
}
fn default_red_timeout_hours() -> u32 {
    4
}
fn default_yellow_timeout_hours() -> u32 {
    24
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            blocked_tools: default_blocked_tools(),
            sensitive_tools: default_sensitive_tools(),
            safe_tools: default_safe_tools(),
            risky_flags: default_risky_flags(),
            amount_params: default_amount_params(),
            amount_threshold: default_amount_threshold(),
            yellow_requires_approval: default_yellow_requires_approval(),
            red_timeout_hours: default_red_timeout_hours(),
            yellow_timeout_hours: default_yellow_timeout_hours(),
        }
    }
}

/// Stateless classifier; tool sets are lower-cased once at construction
#[derive(Debug, Clone)]
pub struct RiskTriageEngine {
    blocked: HashSet<String>,
    sensitive: HashSet<String>,
    safe: HashSet<String>,
    risky_flags: Vec<String>,
    amount_params: Vec<String>,
    amount_threshold: f64,
    yellow_requires_approval: bool,
    red_timeout_hours: u32,
    yellow_timeout_hours: u32,
}

impl Default for RiskTriageEngine {
    fn default() -> Self {
        Self::new(&TriageConfig::default())
    }
}

fn normalized(names: &[String]) -> HashSet<String> {
    names.iter().map(|n| n.trim().to_lowercase()).collect()
}

impl RiskTriageEngine {
    pub fn new(config: &TriageConfig) -> Self {
        Self {
            blocked: normalized(&config.blocked_tools),
            sensitive: normalized(&config.sensitive_tools),
            safe: normalized(&config.safe_tools),
            risky_flags: config.risky_flags.iter().map(|f| f.to_lowercase()).collect(),
            amount_params: config.amount_params.iter().map(|f| f.to_lowercase()).collect(),
            amount_threshold: config.amount_threshold,
            yellow_requires_approval: config.yellow_requires_approval,
            red_timeout_hours: config.red_timeout_hours,
            yellow_timeout_hours: config.yellow_timeout_hours,
        }
    }

    /// Classify an intent. Pure: identical input always yields an identical result.
    pub fn triage(&self, intent: &ActionIntent) -> RiskTriageResult {
        if intent.irreversible {
            return self.result(RiskLane::Red, "marked_irreversible", vec!["irreversible".to_string()]);
        }

        let tool = intent.tool_name.trim().to_lowercase();

        if self.blocked.contains(&tool) {
            return self.result(RiskLane::Blocked, "blocked_tool", vec![format!("tool:{}", tool)]);
        }
        if self.sensitive.contains(&tool) {
            return self.result(RiskLane::Red, "sensitive_tool", vec![format!("tool:{}", tool)]);
        }
        if self.safe.contains(&tool) {
            return self.result(RiskLane::Green, "safe_tool", Vec::new());
        }

        let signals = self.parameter_signals(intent);
        match signals.len() {
            0 => self.result(RiskLane::Yellow, "unknown_tool", vec![format!("tool:{}", tool)]),
            1 => self.result(RiskLane::Yellow, "risky_parameters", signals),
            _ => self.result(RiskLane::Red, "multiple_risk_signals", signals),
        }
    }

    /// Risk signals found in the parameters, in key order
    fn parameter_signals(&self, intent: &ActionIntent) -> Vec<String> {
        let mut signals = Vec::new();
        for (key, value) in &intent.params {
            let key = key.to_lowercase();
            if self.risky_flags.contains(&key) && is_truthy(value) {
                signals.push(format!("flag:{}", key));
            }
            if self.amount_params.contains(&key) {
                if let Some(amount) = as_amount(value) {
                    if amount >= self.amount_threshold {
                        signals.push(format!("amount:{}", key));
                    }
                }
            }
        }
        signals
    }

    fn result(&self, lane: RiskLane, reason: &str, risk_factors: Vec<String>) -> RiskTriageResult {
        let (requires_approval, suggested_timeout_hours) = match lane {
            RiskLane::Red => (true, self.red_timeout_hours),
            RiskLane::Yellow => (self.yellow_requires_approval, self.yellow_timeout_hours),
            RiskLane::Green | RiskLane::Blocked => (false, 0),
        };

        RiskTriageResult {
            lane,
            reason: reason.to_string(),
            risk_factors,
            requires_approval,
            suggested_timeout_hours,
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => {
            matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "on")
        }
        _ => false,
    }
}

fn as_amount(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn intent(tool: &str, params: serde_json::Value) -> ActionIntent {
        let params: BTreeMap<String, serde_json::Value> = serde_json::from_value(params).unwrap();
        ActionIntent::new(tool, params, Uuid::nil(), "s1")
    }

    #[test]
    fn test_irreversible_wins_over_safe_tool() {
        let engine = RiskTriageEngine::default();
        let result = engine.triage(&intent("search", json!({})).irreversible(true));

        assert_eq!(result.lane, RiskLane::Red);
        assert_eq!(result.reason, "marked_irreversible");
        assert!(result.requires_approval);
    }

    #[test]
    fn test_blocked_tool_is_case_insensitive() {
        let engine = RiskTriageEngine::default();
        let result = engine.triage(&intent("Drop_Database", json!({})));

        assert_eq!(result.lane, RiskLane::Blocked);
        assert!(!result.requires_approval);
    }

    #[test]
    fn test_sensitive_and_safe_tools() {
        let engine = RiskTriageEngine::default();

        let red = engine.triage(&intent("delete_record", json!({"id": 4})));
        assert_eq!(red.lane, RiskLane::Red);
        assert_eq!(red.suggested_timeout_hours, 4);

        let green = engine.triage(&intent("search", json!({"force": true})));
        assert_eq!(green.lane, RiskLane::Green);
        assert!(!green.requires_approval);
    }

    #[test]
    fn test_parameter_heuristics() {
        let engine = RiskTriageEngine::default();

        let one = engine.triage(&intent("migrate", json!({"force": "yes"})));
        assert_eq!(one.lane, RiskLane::Yellow);
        assert_eq!(one.reason, "risky_parameters");
        assert_eq!(one.risk_factors, vec!["flag:force"]);

        let two = engine.triage(&intent("migrate", json!({"cascade": true, "amount": "$5,000"})));
        assert_eq!(two.lane, RiskLane::Red);
        assert_eq!(two.risk_factors, vec!["amount:amount", "flag:cascade"]);

        let small = engine.triage(&intent("pay", json!({"amount": 12.5, "force": false})));
        assert_eq!(small.reason, "unknown_tool");
    }

    #[test]
    fn test_yellow_approval_is_configurable() {
        let engine = RiskTriageEngine::new(&TriageConfig {
            yellow_requires_approval: false,
            ..Default::default()
        });

        let result = engine.triage(&intent("mystery", json!({})));
        assert_eq!(result.lane, RiskLane::Yellow);
        assert!(!result.requires_approval);
    }

    #[test]
    fn test_triage_is_repeatable() {
        let engine = RiskTriageEngine::default();
        let subject = intent("transfer", json!({"amount": 2000, "force": 1, "cascade": "on"}));

        let first = serde_json::to_vec(&engine.triage(&subject)).unwrap();
        engine.triage(&intent("delete_record", json!({})));
        let second = serde_json::to_vec(&engine.triage(&subject)).unwrap();

        assert_eq!(first, second);
    }
}
