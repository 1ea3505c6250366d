//! Ollama native chat client
//!
//! Streaming responses are newline-delimited JSON objects; the object with
//! `"done": true` closes the stream and carries the token counts.

use super::{check_status, http_client, network_error};
use crate::config::ResolvedLlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::stream::generate_call_id;
use crate::llm::{
    ChatOptions, ChunkStream, FinishReason, LlmClient, LlmMessage, LlmResponse, LlmStreamChunk,
    ToolCallFragment, ToolDefinition, Usage,
};
use crate::tools::ToolCall;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;
use tracing::{debug, trace, warn};

/// Ollama client
pub struct OllamaClient {
    http: reqwest::Client,
    provider: String,
    model: String,
    base_url: String,
    headers: HashMap<String, String>,
}

impl OllamaClient {
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            provider: config.provider.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            headers: config.headers.clone(),
        })
    }

    fn build_request(
        &self,
        messages: &[LlmMessage],
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
        stream: bool,
    ) -> ChatRequest {
        let options = options.filter(|o| {
            o.temperature.is_some() || o.max_tokens.is_some() || o.top_p.is_some()
        });
        ChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.filter(|tools| !tools.is_empty()),
            stream,
            options: options.map(|o| WireOptions {
                temperature: o.temperature,
                num_predict: o.max_tokens,
                top_p: o.top_p,
            }),
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| network_error(&self.provider, e))?;
        check_status(&self.provider, response).await
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        let request = self.build_request(&messages, tools, options, false);
        if let Some(tools) = &request.tools {
            debug!("Ollama request with {} tools enabled", tools.len());
        }

        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| network_error(&self.provider, e))?;
        let frame: ChatFrame = serde_json::from_str(&body).map_err(|e| LlmError::Protocol {
            message: format!("invalid Ollama response: {}", e),
        })?;

        if let Some(error) = &frame.error {
            return Err(LlmError::Protocol {
                message: error.clone(),
            }
            .into());
        }

        let usage = frame.usage();
        let message = frame.message.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                ToolCall::with_id(generate_call_id(), call.function.name, call.function.arguments)
            })
            .collect();

        let finish_reason = if !tool_calls.is_empty() {
            Some(FinishReason::ToolCalls)
        } else {
            frame.done_reason.as_deref().map(FinishReason::from_wire)
        };

        let message = if tool_calls.is_empty() {
            LlmMessage::assistant(message.content)
        } else {
            LlmMessage::assistant_with_tools(message.content, tool_calls)
        };

        Ok(LlmResponse {
            message,
            usage,
            model: frame.model.unwrap_or_else(|| self.model.clone()),
            finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
    ) -> Result<ChunkStream> {
        let request = self.build_request(&messages, tools, options, true);
        let response = self.send(&request).await?;
        Ok(decode_ndjson(response.bytes_stream()))
    }
}

/// Decode a newline-delimited JSON byte stream into chunks.
///
/// Unlike the SSE decoder this is strict: the first line that fails to
/// parse ends the stream with a `[Error parsing response: ...]` diagnostic.
/// A last frame without a trailing newline still counts.
pub fn decode_ndjson<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes>,
    E: Display,
{
    let bytes: BoxStream<'static, std::io::Result<Bytes>> = bytes
        .map(|chunk| {
            chunk
                .map(Into::into)
                .map_err(|e| std::io::Error::other(e.to_string()))
        })
        .boxed();
    let decoder = NdjsonDecoder {
        lines: BufReader::new(StreamReader::new(bytes)).lines(),
        next_index: 0,
        saw_tool_calls: false,
        finished: false,
    };

    Box::pin(futures::stream::unfold(decoder, |mut decoder| async move {
        let chunk = decoder.next_chunk().await?;
        Some((chunk, decoder))
    }))
}

type FrameLines = Lines<BufReader<StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>>>;

struct NdjsonDecoder {
    lines: FrameLines,
    next_index: usize,
    saw_tool_calls: bool,
    finished: bool,
}

impl NdjsonDecoder {
    async fn next_chunk(&mut self) -> Option<LlmStreamChunk> {
        if self.finished {
            return None;
        }

        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Some(self.fail("[Stream ended before completion]".to_string()));
                }
                Err(e) => {
                    warn!("Ollama stream error: {}", e);
                    return Some(self.fail(format!("[Error reading stream: {}]", e)));
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            if let Some(chunk) = self.decode_line(&line) {
                return Some(chunk);
            }
        }
    }

    fn decode_line(&mut self, line: &str) -> Option<LlmStreamChunk> {
        trace!("Ollama frame: {}", line);
        let frame: ChatFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed Ollama frame: {}", e);
                return Some(self.fail(format!("[Error parsing response: {}]", e)));
            }
        };

        if let Some(error) = &frame.error {
            return Some(self.fail(format!("[Error from Ollama: {}]", error)));
        }

        let usage = frame.usage();
        let message = frame.message.unwrap_or_default();

        let tool_calls: Vec<ToolCallFragment> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let index = self.next_index;
                self.next_index += 1;
                ToolCallFragment {
                    index,
                    id: Some(generate_call_id()),
                    name: Some(call.function.name),
                    arguments: call.function.arguments.to_string(),
                }
            })
            .collect();
        self.saw_tool_calls |= !tool_calls.is_empty();

        let delta = Some(message.content).filter(|content| !content.is_empty());

        if frame.done {
            self.finished = true;
            let finish_reason = if self.saw_tool_calls {
                Some(FinishReason::ToolCalls)
            } else {
                Some(
                    frame
                        .done_reason
                        .as_deref()
                        .map(FinishReason::from_wire)
                        .unwrap_or(FinishReason::Stop),
                )
            };
            return Some(LlmStreamChunk {
                delta,
                tool_calls,
                finish_reason,
                usage,
                done: true,
            });
        }

        if delta.is_none() && tool_calls.is_empty() {
            return None;
        }
        Some(LlmStreamChunk {
            delta,
            tool_calls,
            ..Default::default()
        })
    }

    fn fail(&mut self, message: String) -> LlmStreamChunk {
        self.finished = true;
        LlmStreamChunk::diagnostic(message)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

impl From<&LlmMessage> for WireMessage {
    fn from(message: &LlmMessage) -> Self {
        Self {
            role: message.role.as_str(),
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

/// Ollama sends arguments as a JSON object, not an encoded string
#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<FrameMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl ChatFrame {
    fn usage(&self) -> Option<Usage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(Usage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FrameMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}
