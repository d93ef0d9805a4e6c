//! Model providers
//!
//! The engine only needs "prompt in, text out". Providers are looked up by
//! the model name a step references.
//!
//! ```ignore
//! let registry = ProviderRegistry::from_config(&config);
//! let provider = registry.get("claude")?;
//! let response = provider.complete(&ProviderRequest::new("Summarize")).await?;
//! ```

mod command;
mod http;
mod output;
mod retry;
mod types;

pub use command::CommandProvider;
pub use http::HttpProvider;
pub use output::{extract_code_block, extract_json};
pub use retry::RetryProvider;
pub use types::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse, RetryPolicy};

use crate::config::{EngineConfig, ModelConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// Create a retrying provider for a model config
pub fn create_provider(name: &str, config: &ModelConfig) -> Arc<dyn ModelProvider> {
    let policy = RetryPolicy::from_config(config);
    if config.is_http() {
        Arc::new(RetryProvider::new(HttpProvider::from_config(name, config), policy))
    } else {
        Arc::new(RetryProvider::new(
            CommandProvider::from_config(name, config),
            policy,
        ))
    }
}

/// Providers by model name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build providers for every enabled model in the config
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for (name, model) in config.enabled_models() {
            registry.register(name.clone(), create_provider(name, model));
        }
        registry
    }

    /// Register or replace a provider
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Look up a provider by model name
    pub fn get(&self, model: &str) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        self.providers
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Registered model names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}
