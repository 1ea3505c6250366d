//! CLI configuration loader for omnitrix
//!
//! Implements single-source priority loading with flag overrides:
//! 1. --config file/dir (highest priority)
//! 2. Current working directory: ./.omnitrix.json
//! 3. XDG config: $XDG_CONFIG_HOME/omnitrix/config.json or ~/.config/omnitrix/config.json
//! 4. Built-in defaults (local Ollama)
//!
//! Environment variables fill in provider settings the file leaves out, and
//! command-line flags override everything.

use anyhow::{anyhow, Context, Result};
use omnitrix_core::config::{DEFAULT_MODEL, DEFAULT_PROVIDER};
use omnitrix_core::{AppConfig, ModelParams, ProviderSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the per-project config file
pub const PROJECT_CONFIG_FILE: &str = ".omnitrix.json";

/// Raw configuration file format; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Provider id used for new sessions
    pub default_provider: Option<String>,
    /// Model id used for new sessions
    pub default_model: Option<String>,
    /// Directory holding the session database (`~` is expanded)
    pub data_dir: Option<String>,
    /// Root for tool paths (`~` is expanded)
    pub working_dir: Option<String>,
    /// Maximum model round-trips per turn
    pub max_iterations: Option<usize>,
    /// System prompt prepended to every request
    pub system_prompt: Option<String>,
    /// Sampling parameters
    pub params: ModelParams,
    /// Enabled tools; empty means all built-ins
    pub tools: Vec<String>,
    /// Per-provider settings. An `api_key` may be `env:VAR_NAME`
    pub providers: HashMap<String, ProviderSettings>,
}

/// CLI configuration loader
#[derive(Debug, Default)]
pub struct CliConfigLoader {
    /// Override config file/directory path
    config_override: Option<PathBuf>,
    /// Flag overrides
    provider_override: Option<String>,
    model_override: Option<String>,
    base_url_override: Option<String>,
    api_key_override: Option<String>,
    working_dir_override: Option<PathBuf>,
    data_dir_override: Option<PathBuf>,
    max_iterations_override: Option<usize>,
}

impl CliConfigLoader {
    /// Create a new loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Set config file/directory override
    pub fn with_config_override(mut self, path: PathBuf) -> Self {
        self.config_override = Some(path);
        self
    }

    /// Set provider override
    pub fn with_provider_override(mut self, provider: String) -> Self {
        self.provider_override = Some(provider);
        self
    }

    /// Set model override
    pub fn with_model_override(mut self, model: String) -> Self {
        self.model_override = Some(model);
        self
    }

    /// Set base URL override for the selected provider
    pub fn with_base_url_override(mut self, base_url: String) -> Self {
        self.base_url_override = Some(base_url);
        self
    }

    /// Set API key override for the selected provider
    pub fn with_api_key_override(mut self, api_key: String) -> Self {
        self.api_key_override = Some(api_key);
        self
    }

    /// Set working directory override
    pub fn with_working_dir_override(mut self, path: PathBuf) -> Self {
        self.working_dir_override = Some(path);
        self
    }

    /// Set data directory override
    pub fn with_data_dir_override(mut self, path: PathBuf) -> Self {
        self.data_dir_override = Some(path);
        self
    }

    /// Set iteration cap override
    pub fn with_max_iterations_override(mut self, max_iterations: usize) -> Self {
        self.max_iterations_override = Some(max_iterations);
        self
    }

    /// Whether a provider or model was chosen on the command line
    pub fn has_model_override(&self) -> bool {
        self.provider_override.is_some() || self.model_override.is_some()
    }

    /// Load and resolve configuration
    pub async fn load(&self) -> Result<AppConfig> {
        // Step 1: Find and load base configuration
        let mut raw = if let Some(override_path) = &self.config_override {
            self.load_from_path(override_path).await.with_context(|| {
                format!(
                    "Failed to load config from override path: {}",
                    override_path.display()
                )
            })?
        } else {
            self.search_and_load().await?
        };

        // Step 2: Fill gaps from the environment
        apply_env(&mut raw, |name| std::env::var(name).ok());

        // Step 3: Apply flag overrides and build the final value
        self.resolve_config(raw)
    }

    /// Search for config in priority order
    async fn search_and_load(&self) -> Result<RawConfig> {
        let cwd = std::env::current_dir()?;
        let project = cwd.join(PROJECT_CONFIG_FILE);
        if project.exists() {
            return self.load_file(&project).await;
        }

        if let Some(config_dir) = xdg_config_dir() {
            let config_path = config_dir.join("omnitrix").join("config.json");
            if config_path.exists() {
                return self.load_file(&config_path).await;
            }
        }

        debug!("No config file found, using built-in defaults");
        Ok(RawConfig::default())
    }

    /// Load configuration from a specific path (file or directory)
    async fn load_from_path(&self, path: &Path) -> Result<RawConfig> {
        if path.is_file() {
            self.load_file(path).await
        } else if path.is_dir() {
            let config_file = path.join("config.json");
            if config_file.exists() {
                self.load_file(&config_file).await
            } else {
                Err(anyhow!(
                    "No config.json found in directory: {}",
                    path.display()
                ))
            }
        } else {
            Err(anyhow!("Config path does not exist: {}", path.display()))
        }
    }

    /// Load a single config file
    async fn load_file(&self, path: &Path) -> Result<RawConfig> {
        debug!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Merge a raw config with flag overrides into an [`AppConfig`]
    fn resolve_config(&self, raw: RawConfig) -> Result<AppConfig> {
        let data_dir = match (&self.data_dir_override, &raw.data_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => expand_path(path)?,
            (None, None) => default_data_dir()?,
        };
        let working_dir = match (&self.working_dir_override, &raw.working_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => expand_path(path)?,
            (None, None) => std::env::current_dir().context("Failed to read current directory")?,
        };

        let mut config = AppConfig::new(data_dir, working_dir);
        config.default_provider = self
            .provider_override
            .clone()
            .or(raw.default_provider)
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        config.default_model = self
            .model_override
            .clone()
            .or(raw.default_model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        config.max_iterations = self
            .max_iterations_override
            .or(raw.max_iterations)
            .unwrap_or(config.max_iterations);
        if config.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be at least 1"));
        }
        config.system_prompt = raw.system_prompt;
        config.params = raw.params;
        config.tools = raw.tools;

        for (id, mut settings) in raw.providers {
            settings.api_key = settings.api_key.map(resolve_secret).transpose()?;
            config.providers.insert(id, settings);
        }

        // Flag overrides apply to the provider that will be used
        if self.base_url_override.is_some() || self.api_key_override.is_some() {
            let selected = config
                .providers
                .entry(config.default_provider.clone())
                .or_default();
            if let Some(base_url) = &self.base_url_override {
                selected.base_url = Some(base_url.clone());
            }
            if let Some(api_key) = &self.api_key_override {
                selected.api_key = Some(api_key.clone());
            }
        }

        Ok(config)
    }
}

/// Fill provider settings the file leaves out from environment variables
pub fn apply_env<F>(raw: &mut RawConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("OLLAMA_HOST").filter(|h| !h.trim().is_empty()) {
        let ollama = raw.providers.entry("ollama".to_string()).or_default();
        if ollama.base_url.is_none() {
            ollama.base_url = Some(normalize_host(&host));
        }
    }

    let openai_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
    let openai_base = lookup("OPENAI_BASE_URL").filter(|u| !u.trim().is_empty());
    if openai_key.is_some() || openai_base.is_some() {
        let openai = raw.providers.entry("openai".to_string()).or_default();
        if openai.api_key.is_none() {
            openai.api_key = openai_key;
        }
        if openai.base_url.is_none() {
            openai.base_url = openai_base;
        }
    }
}

/// `OLLAMA_HOST` is often given without a scheme
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Resolve `env:VAR_NAME` references
fn resolve_secret(value: String) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => std::env::var(var_name)
            .with_context(|| format!("Environment variable not found: {}", var_name)),
        None => Ok(value),
    }
}

fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand path: {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".local").join("share").join("omnitrix"))
}

fn xdg_config_dir() -> Option<PathBuf> {
    match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::home_dir().map(|home| home.join(".config")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnitrix_core::Protocol;

    fn write_config(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn test_file_values_and_flag_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "default_provider": "vllm",
                "default_model": "qwen2.5-coder",
                "data_dir": "/var/lib/omnitrix",
                "max_iterations": 4,
                "providers": {
                    "vllm": { "protocol": "openai", "base_url": "http://gpu-box:8000/v1" }
                }
            }"#,
        );

        let config = CliConfigLoader::new()
            .with_config_override(path)
            .with_model_override("llama3.1".to_string())
            .with_working_dir_override(dir.path().to_path_buf())
            .load()
            .await
            .unwrap();

        assert_eq!(config.default_provider, "vllm");
        assert_eq!(config.default_model, "llama3.1");
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/omnitrix"));
        assert_eq!(config.working_dir, dir.path());

        let resolved = config.resolve_llm(None, None).unwrap();
        assert_eq!(resolved.protocol, Protocol::OpenAICompat);
        assert_eq!(resolved.base_url, "http://gpu-box:8000/v1");
    }

    #[tokio::test]
    async fn test_config_directory_needs_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfigLoader::new()
            .with_config_override(dir.path().to_path_buf())
            .load()
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("No config.json found"));

        write_config(dir.path(), "{}");
        let config = CliConfigLoader::new()
            .with_config_override(dir.path().to_path_buf())
            .with_data_dir_override(dir.path().join("data"))
            .load()
            .await
            .unwrap();
        assert_eq!(config.default_model, DEFAULT_MODEL);
        assert_eq!(config.database_path(), dir.path().join("data").join("omnitrix.db"));
    }

    #[tokio::test]
    async fn test_base_url_flag_targets_selected_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{}");

        let config = CliConfigLoader::new()
            .with_config_override(path)
            .with_provider_override("openai".to_string())
            .with_base_url_override("http://localhost:8080/v1".to_string())
            .with_data_dir_override(dir.path().to_path_buf())
            .load()
            .await
            .unwrap();

        let resolved = config.resolve_llm(None, Some("local-model")).unwrap();
        assert_eq!(resolved.protocol, Protocol::OpenAICompat);
        assert_eq!(resolved.base_url, "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn test_invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{ not json");
        let err = CliConfigLoader::new()
            .with_config_override(path)
            .load()
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_env_fills_only_missing_settings() {
        let mut raw: RawConfig = serde_json::from_str(
            r#"{ "providers": { "openai": { "api_key": "sk-from-file" } } }"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("OLLAMA_HOST", "10.0.0.5:11434"),
            ("OPENAI_API_KEY", "sk-from-env"),
            ("OPENAI_BASE_URL", "https://proxy.internal/v1"),
        ]
        .into_iter()
        .collect();

        apply_env(&mut raw, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(
            raw.providers["ollama"].base_url.as_deref(),
            Some("http://10.0.0.5:11434")
        );
        assert_eq!(raw.providers["openai"].api_key.as_deref(), Some("sk-from-file"));
        assert_eq!(
            raw.providers["openai"].base_url.as_deref(),
            Some("https://proxy.internal/v1")
        );
    }

    #[test]
    fn test_tilde_is_expanded() {
        let expanded = expand_path("~/omnitrix-data").unwrap();
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("omnitrix-data"));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let loader = CliConfigLoader::new()
            .with_max_iterations_override(0)
            .with_data_dir_override(PathBuf::from("/tmp/omnitrix"))
            .with_working_dir_override(PathBuf::from("/tmp"));
        assert!(loader.resolve_config(RawConfig::default()).is_err());
    }
}
