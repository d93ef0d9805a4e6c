//! OpenAI-compatible HTTP model provider

use super::types::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse};
use crate::config::ModelConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Provider for chat-completion HTTP APIs
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl HttpProvider {
    pub fn from_config(name: impl Into<String>, config: &ModelConfig) -> Self {
        Self {
            name: name.into(),
            // For HTTP providers, command is the base URL
            base_url: config.command.clone(),
            api_key: config.api_key(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout),
            client: reqwest::Client::new(),
        }
    }

    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(300),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn chat_completion_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> ProviderError {
        match status.as_u16() {
            401 | 403 => ProviderError::Auth {
                message: format!("HTTP {}: {}", status, body),
            },
            429 => ProviderError::RateLimit {
                retry_after: parse_retry_after(body),
            },
            408 | 504 => ProviderError::Timeout {
                elapsed: self.timeout,
            },
            500..=599 => ProviderError::network(format!("HTTP {}: {}", status, body)),
            _ => ProviderError::Unavailable {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

fn parse_retry_after(body: &str) -> Option<Duration> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if request.attachment.is_some() {
            return Err(ProviderError::Unsupported {
                provider: self.name.clone(),
                message: "file attachments are not supported over HTTP".into(),
            });
        }

        let start = Instant::now();

        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(Message {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(Message {
            role: "user",
            content: request.prompt.clone(),
        });

        let body = ChatCompletionRequest {
            model: self.model.clone().unwrap_or_else(|| self.name.clone()),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut http_request = self.client.post(self.chat_completion_url()).json(&body);
        if let Some(ref key) = self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let timeout = request.timeout.unwrap_or(self.timeout);
        tracing::debug!(provider = %self.name, url = %self.chat_completion_url(), "sending chat completion");

        let response = match tokio::time::timeout(timeout, http_request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(ProviderError::Timeout {
                    elapsed: start.elapsed(),
                });
            }
            Ok(Err(e)) => return Err(ProviderError::network(format!("request failed: {}", e))),
            Err(_) => {
                return Err(ProviderError::Timeout {
                    elapsed: start.elapsed(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::parse(format!("failed to parse response: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let mut result = ProviderResponse::new(text, self.name.clone(), start.elapsed());
        if let Some(model) = completion.model {
            result = result.with_model(model);
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_chat_completion_url() {
        let provider = HttpProvider::new("test", "https://api.example.com/v1/");
        assert_eq!(
            provider.chat_completion_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_map_http_error() {
        let provider = HttpProvider::new("test", "https://example.com");

        let err = provider.map_http_error(reqwest::StatusCode::UNAUTHORIZED, "bad token");
        assert!(matches!(err, ProviderError::Auth { .. }));

        let err = provider.map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"retry_after": 2}"#,
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let err = provider.map_http_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejects_attachments() {
        let provider = HttpProvider::new("local", "http://127.0.0.1:9").with_model("m");
        let request = ProviderRequest::new("x").with_attachment(PathBuf::from("a.rs"));
        let result = provider.complete(&request).await;
        assert!(matches!(result, Err(ProviderError::Unsupported { .. })));
        assert!(!provider.supports_attachments());
    }

    #[test]
    fn test_from_config() {
        let config = ModelConfig {
            command: "https://api.openai.com/v1".into(),
            model: Some("gpt-4o".into()),
            timeout: 120,
            ..Default::default()
        };

        let provider = HttpProvider::from_config("openai", &config).with_api_key("sk-test");
        assert_eq!(provider.base_url, "https://api.openai.com/v1");
        assert_eq!(provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(provider.timeout, Duration::from_secs(120));
    }
}
