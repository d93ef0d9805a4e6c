//! Model configuration for LLM providers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single model provider
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Command to execute (or HTTP URL for API providers)
    pub command: String,

    /// Arguments passed before the prompt
    #[serde(default)]
    pub args: Vec<String>,

    /// Whether this model is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Timeout in seconds for requests
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Model id sent to HTTP providers
    pub model: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: Option<String>,

    /// Flag used to attach a file to CLI providers (e.g. "--file")
    pub attachment_arg: Option<String>,

    /// Maximum retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Additional environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000 // 1 second
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            enabled: true,
            timeout: default_timeout(),
            model: None,
            api_key_env: None,
            attachment_arg: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            env: HashMap::new(),
        }
    }
}

impl ModelConfig {
    /// Returns true if this is an HTTP API provider (URL starts with http)
    pub fn is_http(&self) -> bool {
        self.command.starts_with("http://") || self.command.starts_with("https://")
    }

    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}
