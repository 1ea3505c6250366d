//! LLM client trait and response structures

use crate::config::ModelParams;
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use super::message::LlmMessage;

/// Ordered stream of chunks; the last item has `done` set.
///
/// The stream owns the underlying connection, so dropping it closes the transport.
pub type ChunkStream = Pin<Box<dyn Stream<Item = LlmStreamChunk> + Send>>;

/// Trait for LLM clients
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the provider name
    fn provider_name(&self) -> &str;

    /// Send a streaming chat completion request.
    ///
    /// Returns once the backend has accepted the request; transport failures
    /// before that point are returned as errors, later ones arrive as a final
    /// diagnostic chunk.
    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
    ) -> Result<ChunkStream>;
}

/// Response from an LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated message
    pub message: LlmMessage,

    /// Usage statistics
    pub usage: Option<Usage>,

    /// Model used for generation
    pub model: String,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,
}

/// Streaming chunk from an LLM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmStreamChunk {
    /// Delta content
    pub delta: Option<String>,

    /// Tool call fragments in this chunk
    #[serde(default)]
    pub tool_calls: Vec<ToolCallFragment>,

    /// Finish reason if this is the last chunk
    pub finish_reason: Option<FinishReason>,

    /// Usage statistics (usually only in the last chunk)
    pub usage: Option<Usage>,

    /// Terminal marker
    #[serde(default)]
    pub done: bool,
}

impl LlmStreamChunk {
    /// A plain text delta
    pub fn text<S: Into<String>>(delta: S) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Default::default()
        }
    }

    /// The terminal chunk
    pub fn finished(finish_reason: Option<FinishReason>, usage: Option<Usage>) -> Self {
        Self {
            finish_reason,
            usage,
            done: true,
            ..Default::default()
        }
    }

    /// Terminal chunk quoting a framing or transport problem
    pub fn diagnostic<S: Into<String>>(message: S) -> Self {
        Self {
            delta: Some(message.into()),
            finish_reason: Some(FinishReason::Error),
            done: true,
            ..Default::default()
        }
    }

    /// Whether this chunk reports a broken stream rather than model output
    pub fn is_diagnostic(&self) -> bool {
        self.finish_reason == Some(FinishReason::Error)
    }
}

/// Partial tool call as it arrives over a stream.
///
/// Fragments sharing an `index` belong to the same call; `arguments` pieces
/// are concatenated in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Usage statistics for a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,

    /// Number of tokens in the completion
    pub completion_tokens: u32,

    /// Total number of tokens
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reason why generation finished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Generation completed naturally
    Stop,

    /// Hit the maximum token limit
    Length,

    /// Model decided to call a tool
    ToolCalls,

    /// Content was filtered
    ContentFilter,

    /// The stream broke; the chunk's delta carries the diagnostic
    Error,

    /// Other reason
    Other(String),
}

impl FinishReason {
    /// Map a backend finish/stop reason string
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "function_call" | "tool_use" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (usually "function")
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function definition
    pub function: FunctionDefinition,
}

/// Function definition for tool calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Name of the function
    pub name: String,

    /// Description of what the function does
    pub description: String,

    /// JSON schema for the function parameters
    pub parameters: serde_json::Value,
}

/// Options for chat completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    /// Temperature for generation
    pub temperature: Option<f32>,

    /// Top-p sampling parameter
    pub top_p: Option<f32>,
}

impl From<&ModelParams> for ChatOptions {
    fn from(params: &ModelParams) -> Self {
        Self {
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        }
    }
}
