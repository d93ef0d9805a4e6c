//! Retry wrapper with exponential backoff

use super::types::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse, RetryPolicy};
use async_trait::async_trait;

/// Wrapper that adds retry logic to any provider
pub struct RetryProvider<T: ModelProvider> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: ModelProvider> RetryProvider<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: ModelProvider + 'static> ModelProvider for RetryProvider<T> {
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                    tracing::warn!(
                        provider = %self.inner.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_attachments(&self) -> bool {
        self.inner.supports_attachments()
    }
}
