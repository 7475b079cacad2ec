//! Policy evaluation inputs and outputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::intent::RiskLane;

/// Everything a policy rule can match on.
///
/// All fields are plain strings so rules can be authored without knowing
/// the rest of the type hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub tool: String,
    pub action: String,
    pub resource: String,
    pub data_class: String,
    pub user_id: String,

    /// Where the request came from (e.g. "workflow", "cli")
    pub source: String,
}

/// What the policy engine wants done with an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDecision {
    /// Proceed (subject to triage)
    Allow,

    /// Proceed only after human approval
    Defer,

    /// Never proceed
    Deny,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Defer => "DEFER",
            Self::Deny => "DENY",
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub lane: RiskLane,
    pub reason: String,

    /// Rule that produced the decision ("default_allow" when none matched)
    pub policy_name: String,
    pub policy_version: u32,
}

impl PolicyOutcome {
    /// Decision used when no rule matches
    pub fn default_allow() -> Self {
        Self {
            decision: PolicyDecision::Allow,
            lane: RiskLane::Green,
            reason: "no matching policy".to_string(),
            policy_name: "default_allow".to_string(),
            policy_version: 0,
        }
    }

    /// Fail-closed decision used when policies cannot be loaded at all
    pub fn unavailable(error: impl fmt::Display) -> Self {
        Self {
            decision: PolicyDecision::Deny,
            lane: RiskLane::Blocked,
            reason: format!("policy_unavailable: {}", error),
            policy_name: "policy_unavailable".to_string(),
            policy_version: 0,
        }
    }
}
