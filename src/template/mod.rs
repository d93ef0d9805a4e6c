//! Template engine for llm-flow
//!
//! Provides Jinja2-compatible `{{ }}` placeholders in step inputs, actions
//! and outputs.
//!
//! # Names
//!
//! - CLI variables at top level: `{{ topic }}`
//! - Workflow variables: `{{ vars.SUMMARY }}`
//! - Loop values while a loop runs: `{{ loop.iteration }}`, `{{ loop.previous_output }}`,
//!   `{{ loop.max_iterations }}`, `{{ loop.elapsed }}`
//! - Completed steps: `{{ steps.fetch.output }}`
//! - Environment: `{{ env.HOME }}`
//!
//! Filters: `shell_escape`, `json`, `lines`, `tail`, `strftime`, plus the
//! minijinja builtins.

mod context;
mod engine;
mod errors;
mod filters;

pub use context::TemplateContext;
pub use engine::TemplateEngine;
pub use errors::TemplateError;
