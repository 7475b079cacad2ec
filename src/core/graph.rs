//! Dependency graph over plan steps.
//!
//! Steps live in an arena indexed by their position in the plan; edges are
//! kept in both directions so the saga can walk to dependencies (eligibility)
//! and to dependents (denial cascade) without recursion.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::domain::PlanStep;

/// Plan shape errors. All of them are fatal for the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle between steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Planner failed: {0}")]
    PlannerFailed(String),
}

#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Build and validate the graph for a plan
    pub fn build(steps: &[PlanStep]) -> Result<Self, PlanningError> {
        if steps.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(PlanningError::DuplicateStep(step.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index.get(dep).ok_or_else(|| PlanningError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            ids: steps.iter().map(|s| s.id.clone()).collect(),
            index,
            dependencies,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; whatever cannot be ordered sits on a cycle
    fn check_acyclic(&self) -> Result<(), PlanningError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &next in &self.dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited == self.ids.len() {
            return Ok(());
        }

        let stuck = (0..self.ids.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| self.ids[i].clone())
            .collect();
        Err(PlanningError::Cycle(stuck))
    }

    /// Step ids in plan order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    /// Direct dependencies of a step
    pub fn dependencies_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.index
            .get(step_id)
            .map(|&i| self.dependencies[i].as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&d| self.ids[d].as_str())
    }

    /// Every step that transitively depends on `step_id`, in plan order
    pub fn descendants(&self, step_id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(step_id) else {
            return Vec::new();
        };

        let mut seen = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &next in &self.dependents[i] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }

        (0..self.ids.len())
            .filter(|&i| seen[i])
            .map(|i| self.ids[i].as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, "noop", json!({})).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_valid_graph() {
        let graph = StepGraph::build(&[step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])]).unwrap();

        assert_eq!(graph.ids(), &["a", "b", "c"]);
        assert_eq!(graph.dependencies_of("c").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(graph.descendants("a"), vec!["b", "c"]);
        assert!(graph.descendants("c").is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let result = StepGraph::build(&[step("a", &["c"]), step("b", &["a"]), step("c", &["b"]), step("d", &[])]);

        match result {
            Err(PlanningError::Cycle(ids)) => assert_eq!(ids, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = StepGraph::build(&[step("a", &["a"])]);
        assert!(matches!(result, Err(PlanningError::Cycle(_))));
    }

    #[test]
    fn test_unknown_dependency() {
        let result = StepGraph::build(&[step("a", &["ghost"])]);
        assert_eq!(
            result.unwrap_err(),
            PlanningError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_and_empty() {
        assert!(matches!(
            StepGraph::build(&[step("a", &[]), step("a", &[])]),
            Err(PlanningError::DuplicateStep(_))
        ));
        assert!(matches!(StepGraph::build(&[]), Err(PlanningError::EmptyPlan)));
    }

    #[test]
    fn test_diamond_descendants_listed_once() {
        let graph = StepGraph::build(&[
            step("root", &[]),
            step("left", &["root"]),
            step("right", &["root"]),
            step("join", &["left", "right"]),
        ])
        .unwrap();

        assert_eq!(graph.descendants("root"), vec!["left", "right", "join"]);
    }
}
