//! Configuration types and loading for llm-flow

mod agentic;
mod error;
mod loader;
mod model;
mod step;
mod workflow;

pub use agentic::{AgenticLoopConfig, ExitCondition};
pub use error::{ValidationError, ValidationErrors};
pub use loader::{EngineConfig, load_workflow, load_workflow_file};
pub use model::ModelConfig;
pub use step::{
    ApiStepConfig, GenerateConfig, InputKind, InputSpec, NO_INPUT, OutputSpec, ProcessConfig,
    RepoIndexConfig, ResponseFormat, STDIN, STDOUT, StepConfig, StepKind, ToolPermissions,
};
#[cfg(test)]
pub use step::ChunkingConfig;
pub use workflow::{ParallelGroup, WorkflowConfig};
