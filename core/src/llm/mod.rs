//! LLM client abstractions and implementations

pub mod client;
pub mod message;
pub mod providers;
pub mod stream;

pub use client::{
    ChatOptions, ChunkStream, FinishReason, FunctionDefinition, LlmClient, LlmResponse,
    LlmStreamChunk, ToolCallFragment, ToolDefinition, Usage,
};
pub use message::{LlmMessage, MessageRole};
pub use providers::{create_client, OllamaClient, OpenAiClient};
