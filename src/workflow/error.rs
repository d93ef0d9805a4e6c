//! Execution errors

use super::agentic::LoopError;
use super::orchestrator::OrchestratorError;
use crate::config::ValidationErrors;
use crate::provider::ProviderError;
use crate::template::TemplateError;
use crate::tools::ToolError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors while executing a single step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}' has no '{field}'")]
    MissingField { step: String, field: &'static str },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("step '{step}': model '{model}' failed: {source}")]
    Provider {
        step: String,
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("step '{step}': {source}")]
    Tool {
        step: String,
        #[source]
        source: ToolError,
    },

    #[error("step '{step}': I/O error at {path}: {source}")]
    Io {
        step: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}': input '{path}' does not exist")]
    InputNotFound { step: String, path: PathBuf },

    #[error("step '{step}': variable '${name}' is not set")]
    UndefinedVariable { step: String, name: String },

    #[error("step '{step}': all {count} inputs failed, first error: {first}")]
    AllFailed {
        step: String,
        count: usize,
        first: String,
    },

    #[error("step '{step}': {failed} of {total} inputs failed, first error: {first}")]
    PartialFailure {
        step: String,
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("step '{step}': {outputs} output targets for {items} results")]
    OutputMismatch {
        step: String,
        outputs: usize,
        items: usize,
    },

    #[error("step '{step}': response is not valid JSON: {message}")]
    InvalidJson { step: String, message: String },

    #[error("step '{step}': generated workflow is invalid: {message}")]
    InvalidGenerated { step: String, message: String },

    #[error("step '{step}': sub-workflow failed: {source}")]
    SubWorkflow {
        step: String,
        #[source]
        source: Box<WorkflowError>,
    },

    #[error("step '{step}': {source}")]
    Loop {
        step: String,
        #[source]
        source: Box<LoopError>,
    },

    #[error("step '{step}' deferred to unknown step '{target}'")]
    UnknownDeferred { step: String, target: String },

    #[error("step '{step}' exceeded {max} deferred hops")]
    DeferredHopsExceeded { step: String, max: usize },

    #[error("step '{step}': memory error: {message}")]
    Memory { step: String, message: String },

    #[error("step '{step}': repository index failed: {message}")]
    RepoIndex { step: String, message: String },

    #[error("step '{step}': parallel worker panicked")]
    WorkerPanicked { step: String },
}

impl StepError {
    pub(crate) fn io(step: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StepError::Io {
            step: step.to_string(),
            path: path.into(),
            source,
        }
    }
}

/// Errors while running a workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("parallel group '{group}' failed at step '{step}': {source}")]
    Parallel {
        group: String,
        step: String,
        #[source]
        source: StepError,
    },

    #[error("{0}")]
    Loop(#[from] LoopError),

    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("failed to load workflow {path}: {message}")]
    Load { path: PathBuf, message: String },
}

impl WorkflowError {
    /// Best output a timed-out loop produced before failing, if any
    pub fn best_output(&self) -> Option<&str> {
        match self {
            WorkflowError::Loop(LoopError::Timeout { best_output, .. }) => Some(best_output.as_str()),
            _ => None,
        }
    }
}
