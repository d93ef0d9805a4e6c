//! Workflow run results

use super::agentic::{LoopExit, LoopOutcome};
use super::context::RunContext;
use std::collections::HashMap;
use std::time::Duration;

/// How one named loop finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub name: String,
    pub iterations: u32,
    pub exit: LoopExit,
}

impl LoopSummary {
    pub fn new(name: impl Into<String>, outcome: &LoopOutcome) -> Self {
        Self {
            name: name.into(),
            iterations: outcome.iterations,
            exit: outcome.exit,
        }
    }
}

/// Result of executing a workflow
#[derive(Debug)]
pub struct WorkflowResult {
    /// Workflow name
    pub name: String,

    /// Output of the last step or loop
    pub output: String,

    /// Everything written to `STDOUT`, in order
    pub console: Vec<String>,

    /// Step (and loop) name -> output
    pub step_outputs: HashMap<String, String>,

    /// Variable store contents at the end of the run
    pub variables: HashMap<String, String>,

    pub loops: Vec<LoopSummary>,

    /// Total execution time
    pub duration: Duration,
}

impl WorkflowResult {
    /// Create from a finished run
    pub fn from_run(run: RunContext, loops: Vec<LoopSummary>, duration: Duration) -> Self {
        Self {
            name: run.workflow_name().to_string(),
            variables: run.variables.snapshot(),
            output: run.last_output,
            console: run.console,
            step_outputs: run.step_outputs,
            loops,
            duration,
        }
    }

    /// Get a specific step's output
    pub fn step_output(&self, step_name: &str) -> Option<&str> {
        self.step_outputs.get(step_name).map(String::as_str)
    }

    /// Console output joined into one block
    pub fn console_text(&self) -> String {
        self.console.join("\n")
    }
}
