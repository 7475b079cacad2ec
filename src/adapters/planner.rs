//! Planner that serves a fixed, hand-written plan.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::domain::{PlanFile, PlanStep};

use super::Planner;

/// Returns the same steps for every goal
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    steps: Vec<PlanStep>,
}

impl StaticPlanner {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Load steps from a YAML plan file
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(PlanFile::from_file(path)?.steps))
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, goal: &str) -> Result<Vec<PlanStep>> {
        debug!(goal, steps = self.steps.len(), "Serving static plan");
        Ok(self.steps.clone())
    }
}
