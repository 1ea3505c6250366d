//! Configuration types for omnitrix core
//!
//! Core only accepts fully constructed configuration values.
//! All discovery, loading, and merging happens in the CLI layer.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default number of model round-trips allowed per turn
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Default model when nothing else is configured
pub const DEFAULT_MODEL: &str = "deepseek-coder:6.7b";

/// Default provider id when nothing else is configured
pub const DEFAULT_PROVIDER: &str = "ollama";

/// Supported wire protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Ollama native chat API (newline-delimited JSON streaming)
    #[serde(rename = "ollama")]
    Ollama,
    /// OpenAI-compatible chat completions API (server-sent events streaming)
    #[serde(rename = "openai", alias = "openai_compat")]
    OpenAICompat,
}

impl Protocol {
    /// Get the protocol name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ollama => "ollama",
            Protocol::OpenAICompat => "openai",
        }
    }

    /// Get the default base URL for this protocol
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Protocol::Ollama => "http://localhost:11434",
            Protocol::OpenAICompat => "https://api.openai.com/v1",
        }
    }

    /// Infer the protocol from a well-known provider id
    pub fn from_provider_id(id: &str) -> Option<Self> {
        match id {
            "ollama" => Some(Protocol::Ollama),
            "openai" | "openai_compat" => Some(Protocol::OpenAICompat),
            _ => None,
        }
    }
}

/// Model parameters for LLM requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature for sampling (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Top-p sampling parameter
    pub top_p: Option<f32>,
}

/// Settings for one configured provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Whether this provider may be selected
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wire protocol; inferred from the provider id when omitted
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Base URL, protocol default when omitted
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key, if the backend needs one
    #[serde(default)]
    pub api_key: Option<String>,
    /// Models offered by this provider (informational)
    #[serde(default)]
    pub models: Vec<String>,
    /// Additional headers for requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: None,
            base_url: None,
            api_key: None,
            models: Vec::new(),
            headers: HashMap::new(),
        }
    }
}

/// Application configuration handed to every constructor that needs it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the session database
    pub data_dir: PathBuf,
    /// Root that every tool path is contained within
    pub working_dir: PathBuf,
    /// Provider id used for new sessions
    pub default_provider: String,
    /// Model id used for new sessions
    pub default_model: String,
    /// Per-provider settings keyed by provider id
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Maximum model round-trips per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Optional system prompt prepended to every request
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Sampling parameters
    #[serde(default)]
    pub params: ModelParams,
    /// Tools exposed to the model; empty means all built-ins
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

impl AppConfig {
    /// Create a configuration with built-in defaults rooted at the given directories
    pub fn new(data_dir: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            DEFAULT_PROVIDER.to_string(),
            ProviderSettings {
                models: vec![DEFAULT_MODEL.to_string()],
                ..Default::default()
            },
        );

        Self {
            data_dir: data_dir.into(),
            working_dir: working_dir.into(),
            default_provider: DEFAULT_PROVIDER.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            providers,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
            params: ModelParams::default(),
            tools: Vec::new(),
        }
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("omnitrix.db")
    }

    /// Working root as configured
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Resolve a provider/model pair into a ready-to-use LLM configuration.
    ///
    /// `None` selects the configured defaults.
    pub fn resolve_llm(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<ResolvedLlmConfig, ConfigError> {
        let provider_id = provider.unwrap_or(&self.default_provider);
        let model = model.unwrap_or(&self.default_model);

        let settings = match self.providers.get(provider_id) {
            Some(settings) => settings.clone(),
            // Well-known providers work without an explicit entry
            None if Protocol::from_provider_id(provider_id).is_some() => {
                ProviderSettings::default()
            }
            None => {
                return Err(ConfigError::UnknownProvider {
                    provider: provider_id.to_string(),
                })
            }
        };

        if !settings.enabled {
            return Err(ConfigError::ProviderDisabled {
                provider: provider_id.to_string(),
            });
        }

        let protocol = settings
            .protocol
            .or_else(|| Protocol::from_provider_id(provider_id))
            .ok_or_else(|| ConfigError::MissingField {
                field: format!("providers.{}.protocol", provider_id),
            })?;

        let base_url = settings
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| protocol.default_base_url().to_string());

        let resolved = ResolvedLlmConfig {
            provider: provider_id.to_string(),
            protocol,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.unwrap_or_default(),
            model: model.to_string(),
            params: self.params.clone(),
            headers: settings.headers,
        };

        resolved.validate()?;
        Ok(resolved)
    }
}

/// A fully resolved LLM configuration ready for use by core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLlmConfig {
    /// Provider id as named in configuration (stored on sessions)
    pub provider: String,
    /// The protocol to use
    pub protocol: Protocol,
    /// Base URL for the API, without a trailing slash
    pub base_url: String,
    /// API key for authentication, empty when not needed
    pub api_key: String,
    /// Model name/identifier
    pub model: String,
    /// Model parameters
    #[serde(default)]
    pub params: ModelParams,
    /// Additional headers for requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResolvedLlmConfig {
    /// Create a new resolved LLM config
    pub fn new(protocol: Protocol, base_url: String, api_key: String, model: String) -> Self {
        Self {
            provider: protocol.as_str().to_string(),
            protocol,
            base_url,
            api_key,
            model,
            params: ModelParams::default(),
            headers: HashMap::new(),
        }
    }

    /// Set model parameters
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "model".to_string(),
            });
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "base_url".to_string(),
                value: self.base_url.clone(),
            });
        }

        // The public OpenAI endpoint always needs a key; self-hosted compatible servers may not
        if self.protocol == Protocol::OpenAICompat
            && self.base_url == Protocol::OpenAICompat.default_base_url()
            && self.api_key.is_empty()
        {
            return Err(ConfigError::MissingField {
                field: format!("providers.{}.api_key", self.provider),
            });
        }

        if let Some(temp) = self.params.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(ConfigError::InvalidValue {
                    field: "temperature".to_string(),
                    value: temp.to_string(),
                });
            }
        }

        if let Some(top_p) = self.params.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::InvalidValue {
                    field: "top_p".to_string(),
                    value: top_p.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_to_local_ollama() {
        let config = AppConfig::new("/tmp/data", "/tmp/work");
        let resolved = config.resolve_llm(None, None).unwrap();

        assert_eq!(resolved.protocol, Protocol::Ollama);
        assert_eq!(resolved.provider, "ollama");
        assert_eq!(resolved.model, DEFAULT_MODEL);
        assert_eq!(resolved.base_url, "http://localhost:11434");
        assert_eq!(config.max_iterations, 10);
    }

    #[test]
    fn test_unknown_provider_requires_protocol() {
        let mut config = AppConfig::new("/tmp/data", "/tmp/work");
        config.providers.insert(
            "vllm".to_string(),
            ProviderSettings {
                base_url: Some("http://gpu-box:8000/v1/".to_string()),
                ..Default::default()
            },
        );

        let err = config.resolve_llm(Some("vllm"), Some("qwen")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));

        config.providers.get_mut("vllm").unwrap().protocol = Some(Protocol::OpenAICompat);
        let resolved = config.resolve_llm(Some("vllm"), Some("qwen")).unwrap();
        assert_eq!(resolved.base_url, "http://gpu-box:8000/v1");
        assert_eq!(resolved.provider, "vllm");
    }

    #[test]
    fn test_public_openai_requires_key() {
        let config = AppConfig::new("/tmp/data", "/tmp/work");
        let err = config.resolve_llm(Some("openai"), Some("gpt-4o")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_disabled_provider_is_rejected() {
        let mut config = AppConfig::new("/tmp/data", "/tmp/work");
        config.providers.get_mut("ollama").unwrap().enabled = false;
        let err = config.resolve_llm(None, None).unwrap_err();
        assert!(matches!(err, ConfigError::ProviderDisabled { .. }));
    }

    #[test]
    fn test_temperature_range_validated() {
        let mut config = AppConfig::new("/tmp/data", "/tmp/work");
        config.params.temperature = Some(3.5);
        assert!(config.resolve_llm(None, None).is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let json = r#"{
            "data_dir": "/tmp/data",
            "working_dir": "/tmp/work",
            "default_provider": "ollama",
            "default_model": "llama3",
            "providers": { "ollama": { "base_url": "http://127.0.0.1:11434" } }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(config.providers["ollama"].enabled);
        assert!(config.tools.is_empty());
    }
}
