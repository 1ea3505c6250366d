//! The conversation loop
//!
//! One turn: load history, persist the user message, then alternate model
//! calls and sequential tool dispatch until the model answers without tool
//! calls or the iteration cap is hit. Every message is persisted before the
//! next step runs, so an interrupted turn leaves a transcript that can be
//! resumed.

use super::config::AgentConfig;
use super::stream::ConversationStream;
use crate::error::{AgentError, Error, LlmError, Result};
use crate::llm::stream::{generate_call_id, ToolCallAccumulator};
use crate::llm::{ChunkStream, LlmClient, LlmMessage, MessageRole, ToolDefinition, Usage};
use crate::store::{
    FileOperation, MessageUpdate, NewFileChange, NewMessage, NewSession, Store,
};
use crate::tools::{ToolCall, ToolRegistry, ToolResult};
use futures::StreamExt;
use similar::TextDiff;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest session title taken from the first user message
const TITLE_MAX_CHARS: usize = 50;

/// Delta channel capacity; sends beyond it wait for the consumer or cancellation
const DELTA_BUFFER: usize = 64;

/// Drives conversations against one provider client.
///
/// Cheap to clone; clones share the client, registry, store and the set of
/// sessions currently being driven.
#[derive(Clone)]
pub struct Orchestrator {
    config: AgentConfig,
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    store: Store,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Marks a session as being driven until dropped
struct SessionGuard {
    session_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.session_id);
    }
}

/// What a streamed round has produced so far
#[derive(Default)]
struct PartialTurn {
    message_id: Option<String>,
    content: String,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Store,
    ) -> Self {
        Self {
            config,
            client,
            tools,
            store,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one turn to completion and return the final assistant text
    pub async fn converse(
        &self,
        session_id: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let _guard = self.acquire(session_id)?;
        let mut transcript = self.begin_turn(session_id, user_text)?;
        let catalog = self.tools.definitions();

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled.into());
            }
            debug!("Session {} iteration {}", session_id, iteration);

            let request = self.client.chat_completion(
                self.request_messages(&transcript),
                tools_option(&catalog),
                Some(self.config.options.clone()),
            );
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled.into()),
                response = request => response.map_err(|e| {
                    error!("Model call failed for session {}: {}", session_id, e);
                    e
                })?,
            };

            let mut message = response.message;
            message.role = MessageRole::Assistant;
            assign_missing_ids(&mut message.tool_calls);

            self.store.insert_message(
                NewMessage::from_llm(session_id, &message)
                    .with_model(self.client.model_name())
                    .with_usage(response.usage),
            )?;

            if message.is_terminal() {
                info!(
                    "Session {} turn completed after {} model calls",
                    session_id, iteration
                );
                return Ok(message.content);
            }

            let calls = message.tool_calls.clone();
            transcript.push(message);
            self.dispatch_tools(session_id, &calls, &mut transcript, cancel)
                .await?;
        }

        warn!(
            "Session {} hit the iteration cap of {}",
            session_id, self.config.max_iterations
        );
        Err(AgentError::IterationLimitExceeded {
            max_iterations: self.config.max_iterations,
        }
        .into())
    }

    /// Start a streaming turn.
    ///
    /// The user message is persisted before this returns; everything after
    /// runs on one background task that owns the provider connection and
    /// the sending half of the delta channel.
    pub async fn stream_converse(
        &self,
        session_id: &str,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<ConversationStream> {
        let guard = self.acquire(session_id)?;
        let transcript = self.begin_turn(session_id, user_text)?;

        let (sender, receiver) = mpsc::channel(DELTA_BUFFER);
        let this = self.clone();
        let session_id = session_id.to_string();
        let token = cancel.clone();

        let producer = tokio::spawn(async move {
            let _guard = guard;
            let outcome = this
                .drive_stream(&session_id, transcript, &sender, &token)
                .await;

            let notice = match &outcome {
                Ok(_) => None,
                Err(Error::Agent(AgentError::Cancelled)) => {
                    info!("Streaming turn for session {} cancelled", session_id);
                    None
                }
                // Already forwarded as the provider's own diagnostic delta
                Err(Error::Llm(LlmError::Protocol { .. })) => None,
                Err(other) => {
                    error!("Streaming turn for session {} failed: {}", session_id, other);
                    Some(format!("\n[Error: {}]", other))
                }
            };
            if let Some(notice) = notice {
                let _ = send_delta(&sender, notice, &token).await;
            }
            outcome
        });

        Ok(ConversationStream::new(receiver, cancel, producer))
    }

    async fn drive_stream(
        &self,
        session_id: &str,
        mut transcript: Vec<LlmMessage>,
        sender: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let catalog = self.tools.definitions();

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled.into());
            }
            debug!("Session {} streaming iteration {}", session_id, iteration);

            let request = self.client.chat_completion_stream(
                self.request_messages(&transcript),
                tools_option(&catalog),
                Some(self.config.options.clone()),
            );
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled.into()),
                stream = request => stream?,
            };

            let mut partial = PartialTurn::default();
            let outcome = self
                .consume_stream(session_id, stream, sender, cancel, &mut partial)
                .await;

            let message = match outcome {
                Ok(message) => message,
                Err(e) => {
                    self.keep_partial(&partial);
                    return Err(e);
                }
            };

            if message.is_terminal() {
                info!(
                    "Session {} streamed turn completed after {} model calls",
                    session_id, iteration
                );
                return Ok(message.content);
            }

            let calls = message.tool_calls.clone();
            transcript.push(message);
            self.dispatch_tools(session_id, &calls, &mut transcript, cancel)
                .await?;
        }

        Err(AgentError::IterationLimitExceeded {
            max_iterations: self.config.max_iterations,
        }
        .into())
    }

    /// Read one streamed model response, forwarding text as it arrives.
    ///
    /// The assistant row is inserted unfinished on the first delta and
    /// completed in place once the done marker arrives. The stream is dropped
    /// on return, which closes the connection.
    async fn consume_stream(
        &self,
        session_id: &str,
        mut stream: ChunkStream,
        sender: &mpsc::Sender<String>,
        cancel: &CancellationToken,
        partial: &mut PartialTurn,
    ) -> Result<LlmMessage> {
        let mut accumulator = ToolCallAccumulator::new();
        let mut usage: Option<Usage> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled.into()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                let diagnostic = "[Stream ended before completion]".to_string();
                send_delta(sender, diagnostic.clone(), cancel).await?;
                return Err(LlmError::Protocol {
                    message: diagnostic,
                }
                .into());
            };

            if chunk.is_diagnostic() {
                let diagnostic = chunk.delta.unwrap_or_default();
                warn!("Stream for session {} broke: {}", session_id, diagnostic);
                send_delta(sender, diagnostic.clone(), cancel).await?;
                return Err(LlmError::Protocol {
                    message: diagnostic,
                }
                .into());
            }

            if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
                if partial.message_id.is_none() {
                    let placeholder = self.store.insert_message(
                        NewMessage::from_llm(session_id, &LlmMessage::assistant(delta.as_str()))
                            .with_model(self.client.model_name())
                            .unfinished(),
                    )?;
                    partial.message_id = Some(placeholder.id);
                }
                partial.content.push_str(&delta);
                send_delta(sender, delta, cancel).await?;
            }

            for fragment in chunk.tool_calls {
                accumulator.push(fragment);
            }

            if chunk.done {
                usage = usage.or(chunk.usage);
                break;
            }
        }

        let mut tool_calls = accumulator.finish();
        assign_missing_ids(&mut tool_calls);
        let content = std::mem::take(&mut partial.content);
        let message = LlmMessage::assistant_with_tools(content.clone(), tool_calls.clone());

        match partial.message_id.take() {
            Some(id) => {
                self.store.update_message(
                    &id,
                    MessageUpdate {
                        content,
                        tool_calls,
                        finished: true,
                        usage,
                    },
                )?;
            }
            None => {
                self.store.insert_message(
                    NewMessage::from_llm(session_id, &message)
                        .with_model(self.client.model_name())
                        .with_usage(usage),
                )?;
            }
        }

        Ok(message)
    }

    /// Leave an interrupted streamed message in the store, marked unfinished
    fn keep_partial(&self, partial: &PartialTurn) {
        let Some(id) = &partial.message_id else {
            return;
        };
        let update = MessageUpdate {
            content: partial.content.clone(),
            tool_calls: Vec::new(),
            finished: false,
            usage: None,
        };
        if let Err(e) = self.store.update_message(id, update) {
            error!("Failed to save partial message {}: {}", id, e);
        }
    }

    /// Run tool calls one after another, in the order the model asked.
    ///
    /// If cancelled midway, the remaining calls are answered with a
    /// cancellation error so every call in the assistant message still
    /// has its result.
    async fn dispatch_tools(
        &self,
        session_id: &str,
        calls: &[ToolCall],
        transcript: &mut Vec<LlmMessage>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for call in calls {
            let result = if cancel.is_cancelled() {
                ToolResult::error(&call.id, "operation cancelled")
            } else {
                debug!("Dispatching tool {} ({})", call.name, call.id);
                self.tools.execute(call.clone(), cancel).await
            };

            if result.success {
                self.track_file_change(session_id, &result)?;
            }

            let message = LlmMessage::tool(&call.id, result.content);
            self.store
                .insert_message(NewMessage::from_llm(session_id, &message))?;
            transcript.push(message);
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled.into());
        }
        Ok(())
    }

    /// Record a write reported by a tool's structured result
    fn track_file_change(&self, session_id: &str, result: &ToolResult) -> Result<()> {
        let Some(data) = &result.data else {
            return Ok(());
        };
        let operation = match data.get("operation").and_then(|op| op.as_str()) {
            Some("create") => FileOperation::Create,
            Some("modify") => FileOperation::Modify,
            _ => return Ok(()),
        };
        let Some(path) = data.get("path").and_then(|p| p.as_str()) else {
            return Ok(());
        };

        let old_content = data
            .get("old_content")
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let new_content = data
            .get("new_content")
            .and_then(|c| c.as_str())
            .map(str::to_string);

        let diff = TextDiff::from_lines(
            old_content.as_deref().unwrap_or(""),
            new_content.as_deref().unwrap_or(""),
        )
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string();

        self.store.record_file_change(NewFileChange {
            session_id: session_id.to_string(),
            file_path: path.to_string(),
            operation,
            old_content,
            new_content,
            diff,
        })?;
        debug!("Recorded {} of {} for session {}", operation, path, session_id);
        Ok(())
    }

    /// Ensure the session exists, load its history and persist the user message
    fn begin_turn(&self, session_id: &str, user_text: &str) -> Result<Vec<LlmMessage>> {
        if self.store.get_session(session_id)?.is_none() {
            self.store.create_session(NewSession {
                id: session_id.to_string(),
                title: session_title(user_text),
                model: self.client.model_name().to_string(),
                provider: self.client.provider_name().to_string(),
            })?;
            info!("Started session {}", session_id);
        }

        let history = self.store.list_messages(session_id)?;
        let skipped = history.iter().filter(|m| !m.finished).count();
        if skipped > 0 {
            debug!("Not replaying {} interrupted messages", skipped);
        }
        let mut transcript: Vec<LlmMessage> = history
            .iter()
            .filter(|m| m.finished && m.role != MessageRole::System)
            .map(|m| m.to_llm_message())
            .collect();

        let user = LlmMessage::user(user_text);
        self.store
            .insert_message(NewMessage::from_llm(session_id, &user))?;
        transcript.push(user);
        Ok(transcript)
    }

    fn request_messages(&self, transcript: &[LlmMessage]) -> Vec<LlmMessage> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(prompt) = self.config.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            messages.push(LlmMessage::system(prompt.as_str()));
        }
        messages.extend_from_slice(transcript);
        messages
    }

    fn acquire(&self, session_id: &str) -> Result<SessionGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(session_id.to_string()) {
            return Err(AgentError::SessionBusy {
                session_id: session_id.to_string(),
            }
            .into());
        }
        Ok(SessionGuard {
            session_id: session_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }
}

/// Send a delta unless the turn is cancelled first; a dropped receiver
/// counts as cancellation
async fn send_delta(
    sender: &mpsc::Sender<String>,
    delta: String,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled.into()),
        sent = sender.send(delta) => sent.map_err(|_| {
            debug!("Delta receiver dropped");
            AgentError::Cancelled.into()
        }),
    }
}

fn tools_option(catalog: &[ToolDefinition]) -> Option<Vec<ToolDefinition>> {
    (!catalog.is_empty()).then(|| catalog.to_vec())
}

fn assign_missing_ids(calls: &mut [ToolCall]) {
    for call in calls.iter_mut().filter(|call| call.id.is_empty()) {
        call.id = generate_call_id();
    }
}

/// First characters of the opening message, used as the session title
pub fn session_title(text: &str) -> String {
    let text = text.trim();
    let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    if text.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    if title.is_empty() {
        title.push_str("New session");
    }
    title
}
