//! Core orchestration logic.
//!
//! This module contains:
//! - Policy, triage and the MAN task store (the gate in front of every step)
//! - Plan validation and the semantic plan cache
//! - SagaMachine: the pure control loop
//! - EventStore and Orchestrator: the runner around it

pub mod clock;
pub mod embedding;
pub mod entities;
pub mod event_store;
pub mod graph;
pub mod man_store;
pub mod orchestrator;
pub mod plan_cache;
pub mod policy;
pub mod saga;
pub mod triage;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use event_store::{EventStore, Snapshot};
pub use graph::{PlanningError, StepGraph};
pub use man_store::{ManStoreError, ManTaskStore, ManTransition};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunMode, Services};
pub use plan_cache::{CachedPlan, PlanCacheConfig, PlanCacheError, SemanticPlanCache, TemplateStore};
pub use policy::{
    PolicyError, PolicyEvaluator, PolicyMatch, PolicyRule, PolicySource, StaticPolicySource, YamlPolicySource,
};
pub use saga::{SagaError, SagaMachine, SagaSettings};
pub use triage::{RiskTriageEngine, TriageConfig};
