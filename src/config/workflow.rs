//! Workflow definition

use super::agentic::AgenticLoopConfig;
use super::step::StepConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named set of steps run concurrently
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParallelGroup {
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Full workflow definition
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Workflow name
    #[serde(default)]
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Explicit loop execution order
    pub execute_loops: Option<Vec<String>>,

    /// Sequential steps, run in declaration order
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Parallel groups keyed by group name
    #[serde(default)]
    pub parallel: BTreeMap<String, ParallelGroup>,

    /// Steps only reachable through a deferred callback
    #[serde(default)]
    pub deferred: BTreeMap<String, StepConfig>,

    /// Single legacy loop
    pub agentic_loop: Option<AgenticLoopConfig>,

    /// Named loops, ordered by `depends_on` or `execute_loops`
    #[serde(default)]
    pub loops: BTreeMap<String, AgenticLoopConfig>,
}

impl WorkflowConfig {
    /// Parse a TOML workflow document
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        let mut workflow: WorkflowConfig = toml::from_str(source)?;
        workflow.normalize();
        Ok(workflow)
    }

    /// Fill names that are implied by map keys
    pub fn normalize(&mut self) {
        for (name, step) in self.deferred.iter_mut() {
            if step.name.is_empty() {
                step.name = name.clone();
            }
        }
    }

    /// True if this workflow declares any loops
    pub fn has_loops(&self) -> bool {
        self.agentic_loop.is_some() || !self.loops.is_empty()
    }

    /// True if any step, including loop sub-steps, asks for memory injection
    pub fn uses_memory(&self) -> bool {
        fn wants_memory(step: &StepConfig) -> bool {
            step.memory
                || step
                    .agentic_loop
                    .as_ref()
                    .is_some_and(|l| l.steps.iter().any(wants_memory))
        }
        self.all_steps().iter().any(|(_, s)| wants_memory(s))
            || self
                .agentic_loop
                .iter()
                .chain(self.loops.values())
                .any(|l| l.steps.iter().any(wants_memory))
    }

    /// Every step in the workflow with a location label, for validation
    pub fn all_steps(&self) -> Vec<(String, &StepConfig)> {
        let mut all = Vec::new();
        for step in &self.steps {
            all.push(("steps".to_string(), step));
        }
        for (group, g) in &self.parallel {
            for step in &g.steps {
                all.push((format!("parallel.{}", group), step));
            }
        }
        for step in self.deferred.values() {
            all.push(("deferred".to_string(), step));
        }
        all
    }
}
