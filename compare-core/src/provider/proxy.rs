//! Completion provider backed by the chat-completions proxy.
//!
//! The proxy owns the upstream API key and forwards the body untouched, so
//! this client sends `{model, max_tokens, messages}` and reads
//! `{choices: [{message: {content}}]}` back.

use super::{CompletionProvider, CompletionRequest, CompletionResponse, ProviderError};
use async_trait::async_trait;
use compare_common::config::ProxyConfig;
use compare_common::util::{sanitize_for_log, truncate_with_ellipsis};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Sends completions for one model through the proxy endpoint.
pub struct ProxyProvider {
    endpoint: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    choices: Vec<ProxyChoice>,
}

#[derive(Debug, Deserialize)]
struct ProxyChoice {
    message: ProxyResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ProxyResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ProxyProvider {
    /// Create a provider using the proxy settings from configuration.
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn error(&self, request: &CompletionRequest, message: impl Into<String>) -> ProviderError {
        ProviderError::new("proxy", request.model.clone(), message)
    }
}

#[async_trait]
impl CompletionProvider for ProxyProvider {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.error(&request, format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let error_text = truncate_with_ellipsis(&sanitize_for_log(&error_text), 200);
            return Err(self
                .error(&request, format!("API error ({}): {}", status.as_u16(), error_text))
                .with_status(status.as_u16()));
        }

        let result: ProxyResponse = response
            .json()
            .await
            .map_err(|e| self.error(&request, format!("Failed to parse response: {}", e)))?;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.error(&request, "No choices in proxy response"))?;
        let content = choice
            .message
            .content
            .ok_or_else(|| self.error(&request, "Empty content in proxy response"))?;

        Ok(CompletionResponse {
            content,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_deserializes() {
        let json = r#"{
            "id": "gen-1",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let resp: ProxyResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello!"));
    }

    #[test]
    fn missing_choices_deserializes_as_empty() {
        let resp: ProxyResponse = serde_json::from_str(r#"{"error": "quota"}"#).unwrap();
        assert!(resp.choices.is_empty());
    }

    #[test]
    fn provider_uses_configured_endpoint() {
        let config = ProxyConfig {
            endpoint: "http://localhost:9999/api/proxy".into(),
            ..ProxyConfig::default()
        };
        let provider = ProxyProvider::new(&config);
        assert_eq!(provider.endpoint, "http://localhost:9999/api/proxy");
        assert_eq!(provider.name(), "proxy");
    }
}
