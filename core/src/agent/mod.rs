//! Conversation orchestration

pub mod config;
pub mod orchestrator;
pub mod stream;

#[cfg(test)]
mod tests;

pub use config::{AgentBuilder, AgentConfig};
pub use orchestrator::{session_title, Orchestrator};
pub use stream::ConversationStream;
