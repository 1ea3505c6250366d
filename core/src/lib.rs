//! # omnitrix Core
//!
//! Core library for omnitrix - a local coding agent.
//!
//! This library provides the conversation orchestrator, the provider clients
//! for OpenAI-compatible and Ollama backends, the built-in file tools and the
//! SQLite-backed session store.

// Core modules
pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod tools;

// Re-export commonly used types
pub use agent::{AgentBuilder, AgentConfig, ConversationStream, Orchestrator};
pub use config::{AppConfig, ModelParams, Protocol, ProviderSettings, ResolvedLlmConfig};
pub use error::{Error, Result};
pub use store::Store;

/// Current version of the omnitrix-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Initialize tracing with a specific debug mode.
///
/// `RUST_LOG` still wins when set. Output goes to stderr so streamed
/// answers on stdout stay clean.
pub fn init_tracing_with_debug(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
