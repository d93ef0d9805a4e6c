//! Loop DAG orchestrator
//!
//! Named loops declare `depends_on`, `input_state` and `output_state`.
//! Loops run in an explicit `execute_loops` order when one is given,
//! otherwise in a topological order of their dependencies. Values move
//! between loops through the variable store.

use super::agentic::{AgenticLoopEngine, LoopError, LoopOutcome};
use super::context::{ExecutionContext, RunContext};
use super::variables::as_var_ref;
use crate::config::WorkflowConfig;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("execute_loops names unknown loop '{loop_name}'")]
    UnknownLoop { loop_name: String },

    #[error("loop '{loop_name}' depends on unknown loop '{dependency}'")]
    UnknownDependency {
        loop_name: String,
        dependency: String,
    },

    #[error("loop '{loop_name}' is listed more than once in execute_loops")]
    Duplicate { loop_name: String },

    #[error("loop '{loop_name}' is scheduled before its dependency '{dependency}'")]
    OutOfOrder {
        loop_name: String,
        dependency: String,
    },

    #[error("circular loop dependency involving '{loop_name}'")]
    Cycle { loop_name: String },

    #[error("loop '{loop_name}' reads '${variable}' but nothing has set it")]
    MissingInputState {
        loop_name: String,
        variable: String,
    },
}

/// Order in which the named loops run
pub fn plan_loops(workflow: &WorkflowConfig) -> Result<Vec<String>, OrchestratorError> {
    for (name, config) in &workflow.loops {
        for dependency in &config.depends_on {
            if !workflow.loops.contains_key(dependency) {
                return Err(OrchestratorError::UnknownDependency {
                    loop_name: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    match workflow.execute_loops {
        Some(ref order) => check_explicit_order(workflow, order),
        None => topological_order(workflow),
    }
}

fn check_explicit_order(
    workflow: &WorkflowConfig,
    order: &[String],
) -> Result<Vec<String>, OrchestratorError> {
    let mut scheduled: HashSet<&str> = HashSet::new();
    for name in order {
        let Some(config) = workflow.loops.get(name) else {
            return Err(OrchestratorError::UnknownLoop {
                loop_name: name.clone(),
            });
        };
        if scheduled.contains(name.as_str()) {
            return Err(OrchestratorError::Duplicate {
                loop_name: name.clone(),
            });
        }
        if let Some(dependency) = config
            .depends_on
            .iter()
            .find(|d| !scheduled.contains(d.as_str()))
        {
            return Err(OrchestratorError::OutOfOrder {
                loop_name: name.clone(),
                dependency: dependency.clone(),
            });
        }
        scheduled.insert(name);
    }
    Ok(order.to_vec())
}

fn topological_order(workflow: &WorkflowConfig) -> Result<Vec<String>, OrchestratorError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes = HashMap::new();
    for name in workflow.loops.keys() {
        nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for (name, config) in &workflow.loops {
        for dependency in &config.depends_on {
            graph.add_edge(nodes[dependency.as_str()], nodes[name.as_str()], ());
        }
    }

    toposort(&graph, None)
        .map(|order| order.into_iter().map(|n| graph[n].to_string()).collect())
        .map_err(|cycle| OrchestratorError::Cycle {
            loop_name: graph[cycle.node_id()].to_string(),
        })
}

/// Indices of sequential steps that must run before the loops
///
/// A step is pre-loop if it produces a variable some loop reads through
/// `input_state` (and no loop produces), or produces something another
/// pre-loop step reads.
pub fn pre_loop_steps(workflow: &WorkflowConfig) -> BTreeSet<usize> {
    let loop_outputs: HashSet<&str> = workflow
        .loops
        .values()
        .filter_map(|l| l.output_state.as_deref())
        .collect();

    let mut needed: HashSet<String> = workflow
        .loops
        .values()
        .filter_map(|l| l.input_state.as_deref())
        .filter(|v| !loop_outputs.contains(v))
        .map(|v| format!("${}", v))
        .collect();

    let mut pre = BTreeSet::new();
    for (index, step) in workflow.steps.iter().enumerate().rev() {
        let produces_needed = step.produced_outputs().iter().any(|o| needed.contains(o.trim()));
        if !produces_needed {
            continue;
        }
        pre.insert(index);
        if let Some(ref input) = step.input {
            for reference in input.references() {
                let key = match as_var_ref(reference) {
                    Some(name) => format!("${}", name),
                    None => reference.trim().to_string(),
                };
                needed.insert(key);
            }
        }
    }
    pre
}

/// Runs the named loops of a workflow in dependency order
pub struct LoopOrchestrator {
    exec: Arc<ExecutionContext>,
}

impl LoopOrchestrator {
    pub fn new(exec: Arc<ExecutionContext>) -> Self {
        Self { exec }
    }

    /// Run every scheduled loop; returns each loop's outcome in run order
    pub async fn run(
        &self,
        workflow: &WorkflowConfig,
        run: &mut RunContext,
    ) -> Result<Vec<(String, LoopOutcome)>, super::error::WorkflowError> {
        let order = plan_loops(workflow)?;
        let mut outcomes = Vec::with_capacity(order.len());

        for name in order {
            let Some(config) = workflow.loops.get(&name) else {
                continue;
            };
            let initial = match config.input_state.as_deref() {
                Some(variable) => run.variables.get(variable).ok_or_else(|| {
                    OrchestratorError::MissingInputState {
                        loop_name: name.clone(),
                        variable: variable.to_string(),
                    }
                })?,
                None => run.last_output.clone(),
            };

            tracing::info!(loop_name = %name, depends_on = ?config.depends_on, "running loop");
            let result = AgenticLoopEngine::new(self.exec.clone(), name.clone(), config)
                .run(run, initial)
                .await;

            let output = match result {
                Ok(ref outcome) => outcome.output.clone(),
                Err(LoopError::Timeout { ref best_output, .. }) => best_output.clone(),
                Err(_) => String::new(),
            };
            if result.is_ok() || matches!(result, Err(LoopError::Timeout { .. })) {
                if let Some(ref variable) = config.output_state {
                    run.variables.set(variable.clone(), output.clone());
                }
                run.record_output(&name, &output);
            }

            let outcome = result?;
            tracing::info!(
                loop_name = %name,
                iterations = outcome.iterations,
                exit = %outcome.exit,
                "loop finished"
            );
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }
}
