//! CLI module for llm-flow
//!
//! This module provides:
//! - Command implementations (run, validate, states, models)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling for interrupting a run
//!
//! # Example
//!
//! ```ignore
//! use llm_flow::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let exit_code = commands::run_workflow("my-workflow", args, dir, config, &*handler).await?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{
    RunArgs, delete_state, list_models, list_states, run_workflow, show_state, validate_workflow,
};
pub use output::{OutputMode, create_handler};
