//! Command-line model provider

use super::types::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse};
use crate::config::ModelConfig;
use crate::process::{RunError, run_with_input};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Provider that runs a local CLI with the prompt as its final argument
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    command: String,
    args: Vec<String>,
    timeout: Duration,
    env: Vec<(String, String)>,
    attachment_arg: Option<String>,
}

impl CommandProvider {
    pub fn from_config(name: impl Into<String>, config: &ModelConfig) -> Self {
        let mut env: Vec<_> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            name: name.into(),
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout),
            env,
            attachment_arg: config.attachment_arg.clone(),
        }
    }

    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(300),
            env: Vec::new(),
            attachment_arg: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attachment_arg(mut self, arg: impl Into<String>) -> Self {
        self.attachment_arg = Some(arg.into());
        self
    }

    fn build_command(&self, request: &ProviderRequest) -> Result<Command, ProviderError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(ref path) = request.attachment {
            let flag = self
                .attachment_arg
                .as_ref()
                .ok_or_else(|| ProviderError::Unsupported {
                    provider: self.name.clone(),
                    message: "no attachment_arg configured".into(),
                })?;
            cmd.arg(flag).arg(path);
        }

        let prompt = match request.system {
            Some(ref system) => format!("{}\n\n{}", system, request.prompt),
            None => request.prompt.clone(),
        };
        cmd.arg(prompt);

        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl ModelProvider for CommandProvider {
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let cmd = self.build_command(request)?;
        let timeout = request.timeout.unwrap_or(self.timeout);

        tracing::debug!(
            provider = %self.name,
            command = %self.command,
            prompt_len = request.prompt.len(),
            "spawning model command"
        );

        let output = run_with_input(cmd, None, timeout)
            .await
            .map_err(|e| match e {
                RunError::Spawn { .. } => ProviderError::Unavailable {
                    message: e.to_string(),
                },
                RunError::Timeout { elapsed } => ProviderError::Timeout { elapsed },
                other => ProviderError::network(other.to_string()),
            })?;

        if !output.success {
            return Err(ProviderError::ExecutionFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(ProviderResponse::new(
            output.stdout.trim_end().to_string(),
            self.name.clone(),
            output.elapsed,
        ))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_attachments(&self) -> bool {
        self.attachment_arg.is_some()
    }
}
