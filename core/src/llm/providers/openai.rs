//! OpenAI-compatible chat completions client
//!
//! Works against api.openai.com and self-hosted servers speaking the same
//! protocol (vLLM, LM Studio, llama.cpp server). Streaming uses server-sent
//! events terminated by a `data: [DONE]` sentinel.

use super::{check_status, http_client, network_error};
use crate::config::ResolvedLlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::stream::parse_arguments;
use crate::llm::{
    ChatOptions, ChunkStream, FinishReason, LlmClient, LlmMessage, LlmResponse, LlmStreamChunk,
    MessageRole, ToolCallFragment, ToolDefinition, Usage,
};
use crate::tools::ToolCall;
use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use tracing::{debug, trace, warn};

/// OpenAI-compatible client
pub struct OpenAiClient {
    http: reqwest::Client,
    provider: String,
    model: String,
    base_url: String,
    api_key: String,
    headers: HashMap<String, String>,
}

impl OpenAiClient {
    /// Create a new client from resolved LLM config
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            provider: config.provider.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            headers: config.headers.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request(
        &self,
        messages: &[LlmMessage],
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
        stream: bool,
    ) -> ChatRequest {
        let options = options.unwrap_or_default();
        ChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.filter(|tools| !tools.is_empty()),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut builder = self.http.post(self.endpoint()).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
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
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        let request = self.build_request(&messages, tools, options, false);
        if let Some(tools) = &request.tools {
            debug!("OpenAI request with {} tools enabled", tools.len());
        }

        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| network_error(&self.provider, e))?;
        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Protocol {
                message: format!("invalid chat completion response: {}", e),
            })?;

        let response = parsed.into_response(&self.model)?;
        if response.message.has_tool_use() {
            for call in &response.message.tool_calls {
                debug!("Tool call: {} (id: {})", call.name, call.id);
            }
        }
        Ok(response)
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
        Ok(decode_sse(response.bytes_stream().eventsource()))
    }
}

/// Decode an SSE event stream into chunks.
///
/// A frame whose JSON does not parse is skipped with a warning. A transport
/// or SSE decoding error, an in-band API error, or an end of stream without
/// the `[DONE]` sentinel terminates with a diagnostic chunk.
pub fn decode_sse<S, E>(events: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Event, E>> + Send + 'static,
    E: Display,
{
    let decoder = SseDecoder {
        events: events.map(|event| event.map_err(|e| e.to_string())).boxed(),
        finish_reason: None,
        usage: None,
        finished: false,
    };

    Box::pin(futures::stream::unfold(decoder, |mut decoder| async move {
        let chunk = decoder.next_chunk().await?;
        Some((chunk, decoder))
    }))
}

struct SseDecoder {
    events: BoxStream<'static, std::result::Result<Event, String>>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl SseDecoder {
    async fn next_chunk(&mut self) -> Option<LlmStreamChunk> {
        if self.finished {
            return None;
        }

        loop {
            let event = match self.events.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("SSE stream error: {}", e);
                    return Some(self.fail(format!("[Error reading stream: {}]", e)));
                }
                None => {
                    return Some(self.fail("[Stream ended before completion]".to_string()));
                }
            };

            let data = event.data.trim();
            trace!("OpenAI SSE: {:?}", data);
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.finished = true;
                return Some(LlmStreamChunk::finished(
                    self.finish_reason.take(),
                    self.usage.take(),
                ));
            }

            let frame: StreamResponse = match serde_json::from_str(data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Skipping malformed SSE frame ({}): {}", e, data);
                    continue;
                }
            };

            if let Some(error) = frame.error {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Some(self.fail(format!("[API error: {}]", message)));
            }

            if let Some(usage) = frame.usage {
                self.usage = Some(usage.into());
            }

            let Some(choice) = frame.choices.into_iter().next() else {
                continue;
            };
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::from_wire(&reason));
            }

            let chunk = LlmStreamChunk {
                delta: choice.delta.content.filter(|content| !content.is_empty()),
                tool_calls: choice
                    .delta
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(StreamToolCall::into_fragment)
                    .collect(),
                ..Default::default()
            };
            if chunk.delta.is_some() || !chunk.tool_calls.is_empty() {
                return Some(chunk);
            }
        }
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
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&LlmMessage> for WireMessage {
    fn from(message: &LlmMessage) -> Self {
        let tool_calls = (!message.tool_calls.is_empty()).then(|| {
            message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: match &call.arguments {
                            // Raw text the model produced that was not JSON
                            serde_json::Value::String(raw) => raw.clone(),
                            other => other.to_string(),
                        },
                    },
                })
                .collect()
        });

        // Tool-only assistant turns carry null content
        let content = if message.role == MessageRole::Assistant
            && message.content.is_empty()
            && tool_calls.is_some()
        {
            None
        } else {
            Some(message.content.clone())
        };

        Self {
            role: message.role.as_str(),
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl ChatResponse {
    fn into_response(self, requested_model: &str) -> Result<LlmResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol {
                message: "No choices in response".to_string(),
            })?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                ToolCall::with_id(
                    call.id,
                    call.function.name,
                    parse_arguments(&call.function.arguments),
                )
            })
            .collect();

        let content = choice.message.content.unwrap_or_default();
        let message = if tool_calls.is_empty() {
            LlmMessage::assistant(content)
        } else {
            LlmMessage::assistant_with_tools(content, tool_calls)
        };

        Ok(LlmResponse {
            message,
            usage: self.usage.map(Usage::from),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_wire),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl StreamToolCall {
    fn into_fragment(self) -> ToolCallFragment {
        let (name, arguments) = match self.function {
            Some(function) => (function.name, function.arguments.unwrap_or_default()),
            None => (None, String::new()),
        };
        ToolCallFragment {
            index: self.index,
            id: self.id,
            name,
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stream::ToolCallAccumulator;
    use bytes::Bytes;
    use serde_json::json;

    fn sse(frames: &[&str]) -> ChunkStream {
        let body: String = frames.iter().map(|f| format!("data: {}\n\n", f)).collect();
        // Split mid-frame to exercise reassembly
        let (a, b) = body.split_at(body.len() / 2);
        let parts = vec![
            Ok::<_, std::io::Error>(Bytes::from(a.to_string())),
            Ok(Bytes::from(b.to_string())),
        ];
        decode_sse(futures::stream::iter(parts).eventsource())
    }

    #[tokio::test]
    async fn test_stream_text_and_usage() {
        let chunks: Vec<_> = sse(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#,
            "[DONE]",
        ])
        .collect()
        .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].delta.as_deref(), Some("lo"));
        assert!(chunks[2].done);
        assert_eq!(chunks[2].finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunks[2].usage, Some(Usage::new(7, 2)));
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_frame() {
        let chunks: Vec<_> = sse(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            r#"{"choices":[{"delta":"#,
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
            "[DONE]",
        ])
        .collect()
        .await;

        let text: String = chunks.iter().filter_map(|c| c.delta.clone()).collect();
        assert_eq!(text, "ab");
        assert!(chunks.last().unwrap().done);
        assert!(!chunks.last().unwrap().is_diagnostic());
    }

    #[tokio::test]
    async fn test_stream_tool_call_fragments() {
        let chunks: Vec<_> = sse(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"list_dir","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"dir_path\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\".\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ])
        .collect()
        .await;

        let mut acc = ToolCallAccumulator::new();
        for chunk in &chunks {
            for fragment in chunk.tool_calls.clone() {
                acc.push(fragment);
            }
        }
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments, json!({"dir_path": "."}));
        assert_eq!(
            chunks.last().unwrap().finish_reason,
            Some(FinishReason::ToolCalls)
        );
    }

    #[tokio::test]
    async fn test_stream_without_sentinel_ends_with_diagnostic() {
        let chunks: Vec<_> = sse(&[r#"{"choices":[{"delta":{"content":"partial"}}]}"#])
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_diagnostic());
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn test_in_band_error_terminates() {
        let chunks: Vec<_> = sse(&[r#"{"error":{"message":"rate limited"}}"#, "[DONE]"])
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].delta.as_deref().unwrap().contains("rate limited"));
    }

    #[test]
    fn test_wire_messages() {
        let call = ToolCall::with_id("call_1", "read_file", json!({"file_path": "a.rs"}));
        let assistant = WireMessage::from(&LlmMessage::assistant_with_tools("", vec![call]));
        let value = serde_json::to_value(&assistant).unwrap();
        assert_eq!(value["content"], serde_json::Value::Null);
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(
            value["tool_calls"][0]["function"]["arguments"],
            r#"{"file_path":"a.rs"}"#
        );

        let tool = serde_json::to_value(WireMessage::from(&LlmMessage::tool("call_1", "ok"))).unwrap();
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "model": "gpt-4o-2024",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_x",
                        "type": "function",
                        "function": {"name": "list_dir", "arguments": "{\"dir_path\":\".\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        let response = parsed.into_response("gpt-4o").unwrap();

        assert_eq!(response.model, "gpt-4o-2024");
        assert_eq!(response.message.content, "");
        assert_eq!(response.message.tool_calls[0].id, "call_x");
        assert_eq!(response.usage, Some(Usage::new(10, 5)));
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    }
}
