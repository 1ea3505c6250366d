//! Minimal configuration module for omnitrix core
//!
//! Only exports pure data types. All loading logic is in CLI layer.

pub mod types;

pub use types::{
    AppConfig, ModelParams, Protocol, ProviderSettings, ResolvedLlmConfig, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MODEL, DEFAULT_PROVIDER,
};
