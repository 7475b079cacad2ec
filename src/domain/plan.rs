//! Plans, plan steps and cached plan templates.
//!
//! Plans can be written by hand in YAML:
//!
//! ```yaml
//! steps:
//!   - id: search
//!     tool: search_flights
//!     input: { destination: Paris, date: tomorrow }
//!   - id: book
//!     tool: book_flight
//!     depends_on: [search]
//!     compensation_tool: cancel_booking
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single tool call in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step id (unique within the plan)
    pub id: String,

    /// Tool to invoke
    pub tool: String,

    /// Tool input; string values may contain placeholder tokens
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,

    /// Steps that must reach a terminal state first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Tool that undoes this step during rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_tool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    /// Planner marked this step as impossible to undo
    #[serde(default)]
    pub irreversible: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl PlanStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input,
            depends_on: Vec::new(),
            compensation_tool: None,
            rationale: None,
            irreversible: false,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compensation(mut self, tool: impl Into<String>) -> Self {
        self.compensation_tool = Some(tool.into());
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }
}

/// An executable plan for one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,

    /// Steps in planner order
    pub steps: Vec<PlanStep>,

    /// Whether the steps came from the semantic plan cache
    pub cache_hit: bool,

    /// Template the steps were rehydrated from (cache hits only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
}

impl Plan {
    /// Plan freshly produced by the planner
    pub fn generated(plan_id: Uuid, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id,
            steps,
            cache_hit: false,
            template_id: None,
            similarity_score: None,
        }
    }

    /// Plan rehydrated from a cached template
    pub fn cached(plan_id: Uuid, steps: Vec<PlanStep>, template_id: String, similarity: f32) -> Self {
        Self {
            plan_id,
            steps,
            cache_hit: true,
            template_id: Some(template_id),
            similarity_score: Some(similarity),
        }
    }

    pub fn get_step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Hand-written plan file (YAML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Optional description of what the plan achieves
    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<PlanStep>,
}

impl PlanFile {
    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse plan YAML")
    }
}

/// A parameterised plan stored in the semantic plan cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTemplate {
    /// Derived from the template text
    pub template_id: String,

    /// Goal with entities replaced by placeholder tokens
    pub template_text: String,

    /// Embedding of `template_text`
    pub embedding: Vec<f32>,

    /// Steps whose inputs use placeholder tokens
    pub steps: Vec<PlanStep>,

    pub created_at: DateTime<Utc>,

    /// Never served after this instant
    pub expires_at: DateTime<Utc>,
}

impl PlanTemplate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PLAN_YAML: &str = r#"
description: Book a trip
steps:
  - id: search
    tool: search_flights
    input:
      destination: Paris
      date: tomorrow
  - id: book
    tool: book_flight
    depends_on: [search]
    compensation_tool: cancel_booking
  - id: notify
    tool: send_email
    depends_on: [book]
    irreversible: true
"#;

    #[test]
    fn test_plan_file_parsing() {
        let plan = PlanFile::from_yaml(TEST_PLAN_YAML).unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].input["destination"], "Paris");
        assert_eq!(plan.steps[1].depends_on, vec!["search".to_string()]);
        assert_eq!(plan.steps[1].compensation_tool.as_deref(), Some("cancel_booking"));
        assert!(plan.steps[2].irreversible);
    }

    #[test]
    fn test_missing_input_defaults_to_object() {
        let plan = PlanFile::from_yaml(TEST_PLAN_YAML).unwrap();
        assert!(plan.steps[1].input.is_object());
    }

    #[test]
    fn test_template_expiry_is_inclusive() {
        let now = Utc::now();
        let template = PlanTemplate {
            template_id: "t".to_string(),
            template_text: "book flight to {LOCATION}".to_string(),
            embedding: vec![1.0],
            steps: Vec::new(),
            created_at: now,
            expires_at: now,
        };

        assert!(template.is_expired(now));
        assert!(!template.is_expired(now - chrono::Duration::seconds(1)));
    }
}
