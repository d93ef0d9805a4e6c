//! Core types and traits for model providers

use crate::config::ModelConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error types that can occur while calling a model
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Request timed out
    #[error("timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Rate limited by the provider
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Network error
    #[error("network error: {message}")]
    Network { message: String },

    /// Failed to parse response
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Command execution failed
    #[error("execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Provider unavailable
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    /// No provider is configured under this name
    #[error("model '{model}' is not configured")]
    UnknownModel { model: String },

    /// The request asks for something this provider cannot do
    #[error("unsupported request for '{provider}': {message}")]
    Unsupported { provider: String, message: String },
}

impl ProviderError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::RateLimit { .. }
                | ProviderError::Network { .. }
        )
    }

    /// Get suggested retry delay for rate limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

/// Response from a model
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Raw text output
    pub text: String,

    /// Provider name that produced this response
    pub provider: String,

    /// Model reported by the provider, if any
    pub model: Option<String>,

    /// Time taken
    pub duration: Duration,
}

impl ProviderResponse {
    pub fn new(text: impl Into<String>, provider: impl Into<String>, duration: Duration) -> Self {
        Self {
            text: text.into(),
            provider: provider.into(),
            model: None,
            duration,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A single prompt sent to a model
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// The prompt to send
    pub prompt: String,

    /// System prompt (if supported)
    pub system: Option<String>,

    /// File attached to the request
    pub attachment: Option<PathBuf>,

    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,

    /// Override timeout for this request
    pub timeout: Option<Duration>,

    /// Working directory for command providers
    pub working_dir: Option<PathBuf>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_attachment(mut self, path: PathBuf) -> Self {
        self.attachment = Some(path);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

/// A model the engine can send prompts to
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send a request and wait for the full response
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Provider name
    fn name(&self) -> &str;

    /// Whether files can be passed by path instead of inlined into the prompt
    fn supports_attachments(&self) -> bool {
        false
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_delay_ms),
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            capped_delay + rand::random::<f64>() * 0.25 * capped_delay
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}
