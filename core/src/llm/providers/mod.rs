//! LLM provider implementations

pub mod ollama;
pub mod openai;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use crate::config::{Protocol, ResolvedLlmConfig};
use crate::error::{LlmError, Result};
use crate::llm::LlmClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Build the client for a resolved configuration.
///
/// The protocol alone decides the backend; the orchestrator never
/// branches on it.
pub fn create_client(config: &ResolvedLlmConfig) -> Result<Arc<dyn LlmClient>> {
    config.validate()?;
    let client: Arc<dyn LlmClient> = match config.protocol {
        Protocol::Ollama => Arc::new(OllamaClient::new(config)?),
        Protocol::OpenAICompat => Arc::new(OpenAiClient::new(config)?),
    };
    Ok(client)
}

/// HTTP client shared by the backends.
///
/// No overall timeout: streamed responses may legitimately run for minutes,
/// and cancellation drops the request instead.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Turn a non-2xx response into a transport error carrying the raw body
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
    error!("{} API call failed with status {}: {}", provider, status, body);
    Err(LlmError::Transport {
        status: status.as_u16(),
        body,
    }
    .into())
}

/// Map a failure to send the request or read the response
pub(crate) fn network_error(provider: &str, err: reqwest::Error) -> LlmError {
    error!("{} request failed: {}", provider, err);
    LlmError::Network {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_picks_backend_by_protocol() {
        let ollama = ResolvedLlmConfig::new(
            Protocol::Ollama,
            "http://localhost:11434".to_string(),
            String::new(),
            "deepseek-coder:6.7b".to_string(),
        );
        let client = create_client(&ollama).unwrap();
        assert_eq!(client.model_name(), "deepseek-coder:6.7b");
        assert_eq!(client.provider_name(), "ollama");

        let vllm = ResolvedLlmConfig {
            provider: "vllm".to_string(),
            ..ResolvedLlmConfig::new(
                Protocol::OpenAICompat,
                "http://localhost:8000/v1".to_string(),
                String::new(),
                "qwen2.5-coder".to_string(),
            )
        };
        let client = create_client(&vllm).unwrap();
        assert_eq!(client.provider_name(), "vllm");
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = ResolvedLlmConfig::new(
            Protocol::OpenAICompat,
            "https://api.openai.com/v1".to_string(),
            String::new(),
            "gpt-4o".to_string(),
        );
        assert!(create_client(&config).is_err());
    }
}
