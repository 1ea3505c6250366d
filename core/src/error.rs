//! Error types and handling for omnitrix core

use thiserror::Error;

/// Result type alias for omnitrix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for omnitrix core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Provider client errors
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool execution errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Orchestration errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Persistence errors that are not raw SQLite failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("Unknown provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("Provider is disabled: {provider}")]
    ProviderDisabled { provider: String },

    #[error("Working directory is not usable: {path}")]
    InvalidWorkingDir { path: String },
}

/// Provider client errors
#[derive(Error, Debug)]
pub enum LlmError {
    /// Non-2xx response from the backend, body kept verbatim for diagnostics
    #[error("API error: {status} - {body}")]
    Transport { status: u16, body: String },

    #[error("Network error: {message}")]
    Network { message: String },

    /// Malformed response body or streaming frame
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

/// Tool execution errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("invalid arguments: {message}")]
    Validation { message: String },

    #[error("access denied: {path} is outside the working directory")]
    AccessDenied { path: String },

    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("file too large ({size} bytes, max {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("{name} failed: {message}")]
    ExecutionFailed { name: String, message: String },
}

/// Orchestration errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("exceeded maximum iterations ({max_iterations})")]
    IterationLimitExceeded { max_iterations: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("session {session_id} is already being driven")]
    SessionBusy { session_id: String },
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },

    #[error("Failed to acquire database lock")]
    LockPoisoned,
}

impl Error {
    /// Whether this error came from cancelling the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Agent(AgentError::Cancelled))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Generic(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Generic(msg.to_string())
    }
}
