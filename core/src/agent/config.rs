//! Agent configuration structures

use crate::config::{AppConfig, DEFAULT_MAX_ITERATIONS};
use crate::error::Result;
use crate::llm::{create_client, ChatOptions, LlmClient};
use crate::store::Store;
use crate::tools::{ToolRegistry, WorkingRoot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::Orchestrator;

/// Configuration for an orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model round-trips per turn
    pub max_iterations: usize,

    /// Prepended to every request, never persisted
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Sampling options passed to the provider
    #[serde(default)]
    pub options: ChatOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
            options: ChatOptions::default(),
        }
    }
}

impl From<&AppConfig> for AgentConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            system_prompt: config.system_prompt.clone(),
            options: ChatOptions::from(&config.params),
        }
    }
}

/// Builds an [`Orchestrator`] and its collaborators from an [`AppConfig`]
pub struct AgentBuilder {
    app_config: AppConfig,
    provider: Option<String>,
    model: Option<String>,
    client: Option<Arc<dyn LlmClient>>,
    store: Option<Store>,
}

impl AgentBuilder {
    pub fn new(app_config: AppConfig) -> Self {
        Self {
            app_config,
            provider: None,
            model: None,
            client: None,
            store: None,
        }
    }

    /// Select a provider other than the configured default
    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    /// Select a model other than the configured default
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Use an already constructed client instead of resolving one
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use an open store instead of the database in the data directory
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let client = match self.client {
            Some(client) => client,
            None => {
                let resolved = self
                    .app_config
                    .resolve_llm(self.provider.as_deref(), self.model.as_deref())?;
                debug!(
                    "Using provider {} ({}) at {} with model {}",
                    resolved.provider,
                    resolved.protocol.as_str(),
                    resolved.base_url,
                    resolved.model
                );
                create_client(&resolved)?
            }
        };

        let root = WorkingRoot::new(self.app_config.working_dir())?;
        let tools = ToolRegistry::with_builtins(&root, &self.app_config.tools)?;

        let store = match self.store {
            Some(store) => store,
            None => Store::open(&self.app_config.database_path())?,
        };

        Ok(Orchestrator::new(
            AgentConfig::from(&self.app_config),
            client,
            Arc::new(tools),
            store,
        ))
    }
}
