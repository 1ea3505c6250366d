//! CLI command implementations

pub mod chat;
pub mod sessions;
pub mod tools;

pub use chat::{interactive_command, run_command, ChatOptions};
pub use sessions::{delete_command, history_command, sessions_command};
pub use tools::tools_command;
