//! Workflow execution engine for llm-flow
//!
//! This module handles:
//! - Graph validation before anything runs
//! - Step dispatch for every step kind, with deferred hand-offs
//! - Concurrent parallel groups
//! - Agentic loops with checkpointed state
//! - Ordering of named loops by their dependencies
//!
//! # Example
//!
//! ```ignore
//! use llm_flow::workflow::{ExecutionContext, RunOptions, WorkflowRunner};
//! use llm_flow::config::{EngineConfig, load_workflow};
//! use std::sync::Arc;
//!
//! let config = Arc::new(EngineConfig::load(None)?);
//! let providers = ProviderRegistry::from_config(&config);
//! let exec = Arc::new(ExecutionContext::new(config, providers, Path::new(".")));
//!
//! let (workflow, path) = load_workflow("review", None)?;
//! let result = WorkflowRunner::new(exec).run(workflow, options).await?;
//! println!("{}", result.console_text());
//! ```

mod agentic;
mod context;
mod dispatcher;
mod error;
mod inputs;
mod loop_state;
mod orchestrator;
mod parallel;
mod repo_index;
mod runner;
mod state;
mod validator;
mod variables;

pub use context::ExecutionContext;
pub use error::WorkflowError;
pub use loop_state::{LoopState, LoopStateManager, LoopStatus};
pub use runner::{RunOptions, WorkflowRunner};
pub use validator::validate;
