//! Shell tool execution with allow/deny lists

use crate::config::ToolPermissions;
use crate::process::{RunError, run_with_input};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool '{program}' denied: {reason}")]
    Denied { program: String, reason: String },

    #[error("tool command failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("tool command could not run: {message}")]
    Io { message: String },
}

/// Runs tool commands on behalf of steps
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `command`, piping `input` to its stdin, under `permissions`
    async fn run(
        &self,
        command: &str,
        input: Option<&str>,
        permissions: &ToolPermissions,
    ) -> Result<String, ToolError>;
}

/// First word of a command line, without any leading path
pub fn program_name(command: &str) -> &str {
    let first = command.split_whitespace().next().unwrap_or("");
    first.rsplit('/').next().unwrap_or(first)
}

/// Check a program against a permission set
///
/// Denied always wins; a non-empty allowed list is exclusive.
pub fn check_permission(program: &str, permissions: &ToolPermissions) -> Result<(), ToolError> {
    if permissions.denied.iter().any(|d| d == program) {
        return Err(ToolError::Denied {
            program: program.to_string(),
            reason: "listed in denied tools".into(),
        });
    }
    if !permissions.allowed.is_empty() && !permissions.allowed.iter().any(|a| a == program) {
        return Err(ToolError::Denied {
            program: program.to_string(),
            reason: "not in allowed tools".into(),
        });
    }
    Ok(())
}

/// Executes tools through `sh -c` in a working directory
#[derive(Debug, Clone)]
pub struct ShellToolExecutor {
    working_dir: PathBuf,
    timeout: Duration,
}

impl ShellToolExecutor {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolExecutor for ShellToolExecutor {
    async fn run(
        &self,
        command: &str,
        input: Option<&str>,
        permissions: &ToolPermissions,
    ) -> Result<String, ToolError> {
        let program = program_name(command);
        check_permission(program, permissions)?;

        tracing::debug!(tool = %program, command = %command, "running tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.working_dir);

        let output = run_with_input(cmd, input, self.timeout)
            .await
            .map_err(|e| match e {
                RunError::Timeout { elapsed } => ToolError::Failed {
                    exit_code: None,
                    stderr: format!("timed out after {:?}", elapsed),
                },
                other => ToolError::Io {
                    message: other.to_string(),
                },
            })?;

        if !output.success {
            return Err(ToolError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}
