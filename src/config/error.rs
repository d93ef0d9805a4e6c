//! Validation error types

use std::fmt;
use thiserror::Error;

/// A single problem found while validating a workflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // Configuration errors
    #[error("{kind} step '{step}' missing '{field}' field")]
    MissingField {
        step: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("step '{step}' mixes fields from several kinds: {}", .kinds.join(", "))]
    ConflictingKinds { step: String, kinds: Vec<String> },

    #[error("duplicate step name: {step}")]
    DuplicateStep { step: String },

    #[error("loop '{loop_name}': {message}")]
    InvalidLoop { loop_name: String, message: String },

    #[error("step '{step}' has an invalid template: {message}")]
    InvalidTemplate { step: String, message: String },

    // Dependency errors
    #[error("circular dependency detected involving step '{step}'")]
    CircularDependency { step: String },

    #[error(
        "parallel group '{group}': steps '{first}' and '{second}' both write '{output}'"
    )]
    OutputCollision {
        group: String,
        output: String,
        first: String,
        second: String,
    },

    #[error(
        "parallel group '{group}': step '{step}' consumes '{output}' produced by '{producer}' in the same group"
    )]
    IntraGroupDependency {
        group: String,
        step: String,
        output: String,
        producer: String,
    },

    #[error("loop dependency error: {message}")]
    LoopDependency { message: String },
}

impl ValidationError {
    /// True for dependency-graph problems as opposed to field problems
    pub fn is_dependency_error(&self) -> bool {
        matches!(
            self,
            ValidationError::CircularDependency { .. }
                | ValidationError::OutputCollision { .. }
                | ValidationError::IntraGroupDependency { .. }
                | ValidationError::LoopDependency { .. }
        )
    }
}

/// Every problem found in one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// Ok if nothing was found
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow validation failed:")?;
        for error in &self.0 {
            write!(f, "\n  {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
