//! Action intents and risk classification results.
//!
//! An intent is what the orchestrator wants to do with a tool; triage turns
//! it into a risk lane that decides whether the step runs, waits for a human,
//! or never runs at all.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single tool invocation the orchestrator intends to perform.
///
/// Built once from a plan step and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionIntent {
    /// Tool to invoke (e.g. "delete_record")
    pub tool_name: String,

    /// Tool parameters, ordered by key
    pub params: BTreeMap<String, serde_json::Value>,

    /// Workflow this intent belongs to
    pub workflow_id: Uuid,

    /// Plan step that produced this intent
    pub step_id: String,

    /// Why the planner wants this action (if it said)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    /// Explicitly flagged as impossible to undo
    #[serde(default)]
    pub irreversible: bool,
}

impl ActionIntent {
    /// Create an intent with no rationale that is not flagged irreversible
    pub fn new(
        tool_name: impl Into<String>,
        params: BTreeMap<String, serde_json::Value>,
        workflow_id: Uuid,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            workflow_id,
            step_id: step_id.into(),
            rationale: None,
            irreversible: false,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn irreversible(mut self, irreversible: bool) -> Self {
        self.irreversible = irreversible;
        self
    }
}

/// Discrete risk classification, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLane {
    /// Safe to auto-execute
    Green,

    /// Some risk signals present
    Yellow,

    /// High risk, a human must sign off
    Red,

    /// Never executes, not even with approval
    Blocked,
}

impl RiskLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for RiskLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running an intent through the triage rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTriageResult {
    /// Assigned lane
    pub lane: RiskLane,

    /// Machine-readable reason code (e.g. "sensitive_tool")
    pub reason: String,

    /// Individual signals that contributed to the lane
    #[serde(default)]
    pub risk_factors: Vec<String>,

    /// Whether a MAN task must be created before the step may run
    pub requires_approval: bool,

    /// How long a human gets to decide before the task expires
    pub suggested_timeout_hours: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_ordering() {
        assert!(RiskLane::Green < RiskLane::Yellow);
        assert!(RiskLane::Yellow < RiskLane::Red);
        assert!(RiskLane::Red < RiskLane::Blocked);
        assert_eq!(RiskLane::Yellow.max(RiskLane::Red), RiskLane::Red);
    }

    #[test]
    fn test_lane_serialization() {
        let json = serde_json::to_string(&RiskLane::Blocked).unwrap();
        assert_eq!(json, "\"BLOCKED\"");

        let parsed: RiskLane = serde_json::from_str("\"YELLOW\"").unwrap();
        assert_eq!(parsed, RiskLane::Yellow);
    }

    #[test]
    fn test_intent_builder() {
        let intent = ActionIntent::new("delete_record", BTreeMap::new(), Uuid::nil(), "s1")
            .with_rationale("cleanup")
            .irreversible(true);

        assert_eq!(intent.rationale.as_deref(), Some("cleanup"));
        assert!(intent.irreversible);
    }
}
