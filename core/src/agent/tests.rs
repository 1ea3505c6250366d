use super::*;
use crate::error::{AgentError, Error, LlmError, Result};
use crate::llm::{
    ChatOptions, ChunkStream, FinishReason, LlmClient, LlmMessage, LlmResponse, LlmStreamChunk,
    MessageRole, ToolCallFragment, ToolDefinition, Usage,
};
use crate::store::{FileOperation, Store};
use crate::tools::{ToolCall, ToolRegistry, WorkingRoot};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MODEL: &str = "deepseek-coder:6.7b";

/// Replays canned responses and records every request
#[derive(Default)]
struct ScriptedClient {
    responses: Mutex<VecDeque<Result<LlmResponse>>>,
    streams: Mutex<VecDeque<ChunkStream>>,
    /// Returned once the script runs out
    fallback: Option<LlmResponse>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<LlmMessage>>>,
}

impl ScriptedClient {
    fn with_responses(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    fn with_streams(streams: Vec<ChunkStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into_iter().collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> Vec<LlmMessage> {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        _tools: Option<Vec<ToolDefinition>>,
        _options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages);
        let next = self.responses.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(response), _) => response,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => panic!("script exhausted"),
        }
    }

    fn model_name(&self) -> &str {
        MODEL
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        _tools: Option<Vec<ToolDefinition>>,
        _options: Option<ChatOptions>,
    ) -> Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages);
        Ok(self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .expect("stream script exhausted"))
    }
}

fn text(content: &str) -> LlmResponse {
    LlmResponse {
        message: LlmMessage::assistant(content),
        usage: Some(Usage::new(20, 6)),
        model: MODEL.to_string(),
        finish_reason: Some(FinishReason::Stop),
    }
}

fn tool_calls(calls: Vec<ToolCall>) -> LlmResponse {
    LlmResponse {
        message: LlmMessage::assistant_with_tools("", calls),
        usage: Some(Usage::new(30, 4)),
        model: MODEL.to_string(),
        finish_reason: Some(FinishReason::ToolCalls),
    }
}

fn chunks(items: Vec<LlmStreamChunk>) -> ChunkStream {
    Box::pin(futures::stream::iter(items))
}

struct Fixture {
    dir: tempfile::TempDir,
    store: Store,
    client: Arc<ScriptedClient>,
    orchestrator: Orchestrator,
}

fn fixture(client: ScriptedClient, config: AgentConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();

    let root = WorkingRoot::new(dir.path()).unwrap();
    let tools = Arc::new(ToolRegistry::with_builtins(&root, &[]).unwrap());
    let store = Store::open_in_memory().unwrap();
    let client = Arc::new(client);
    let orchestrator = Orchestrator::new(config, client.clone(), tools, store.clone());

    Fixture {
        dir,
        store,
        client,
        orchestrator,
    }
}

/// Every tool message answers a call of the assistant message right before
/// the run of tool messages it belongs to
fn assert_tool_ids_paired(messages: &[crate::store::Message]) {
    let mut open_calls: Vec<String> = Vec::new();
    for message in messages {
        match message.role {
            MessageRole::Assistant => {
                open_calls = message.tool_calls.iter().map(|c| c.id.clone()).collect();
            }
            MessageRole::Tool => {
                let id = message.tool_call_id.as_deref().expect("tool message without id");
                assert!(
                    open_calls.iter().any(|open| open == id),
                    "tool result {} has no matching call in {:?}",
                    id,
                    open_calls
                );
            }
            _ => open_calls.clear(),
        }
    }
}

#[tokio::test]
async fn test_list_files_scenario() {
    let client = ScriptedClient::with_responses(vec![
        tool_calls(vec![ToolCall::with_id(
            "call_1",
            "list_dir",
            json!({"dir_path": "."}),
        )]),
        text("The directory contains main.go and README.md."),
    ]);
    let f = fixture(client, AgentConfig::default());

    let answer = f
        .orchestrator
        .converse("s1", "list files in .", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "The directory contains main.go and README.md.");

    let messages = f.store.list_messages("s1").unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );

    assert_eq!(messages[0].content, "list files in .");
    assert_eq!(messages[1].tool_calls.len(), 1);
    assert_eq!(messages[1].tool_calls[0].name, "list_dir");
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert!(messages[2].content.contains("main.go"));
    assert!(messages[2].content.contains("README.md"));
    assert!(!messages[2].content.contains("Directories:"));
    assert!(messages[3].tool_calls.is_empty());
    assert!(!messages[3].content.is_empty());
    assert!(messages.iter().all(|m| m.finished));

    let session = f.store.get_session("s1").unwrap().unwrap();
    assert_eq!(session.model, MODEL);
    assert_eq!(session.provider, "ollama");
    assert_eq!(session.title, "list files in .");
    assert_eq!(session.message_count, 4);
    assert_eq!(session.prompt_tokens, 50);
    assert_eq!(session.completion_tokens, 10);

    // The second request replays the call and its result
    let second = f.client.request(1);
    assert_eq!(second.len(), 3);
    assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn test_bad_tool_calls_do_not_abort_the_loop() {
    let client = ScriptedClient::with_responses(vec![
        tool_calls(vec![
            ToolCall::with_id("call_a", "read_file", json!({})),
            ToolCall::with_id("call_b", "run_shell", json!({"cmd": "ls"})),
            ToolCall::with_id("call_c", "read_file", json!({"file_path": "../outside.txt"})),
            ToolCall::with_id("call_d", "read_file", json!({"file_path": "main.go"})),
        ]),
        text("Sorry, let me try again."),
    ]);
    let f = fixture(client, AgentConfig::default());

    f.orchestrator
        .converse("s1", "read main.go", &CancellationToken::new())
        .await
        .unwrap();

    let messages = f.store.list_messages("s1").unwrap();
    let results: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(results.len(), 4);
    assert!(results[0].starts_with("Error: invalid arguments: missing required parameter(s): file_path"));
    assert!(results[1].starts_with("Error: unknown tool: run_shell"));
    assert!(results[2].starts_with("Error: access denied"));
    assert!(results[3].contains("package main"));

    // Results keep the order the model asked for
    let ids: Vec<&str> = messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["call_a", "call_b", "call_c", "call_d"]);
    assert_tool_ids_paired(&messages);
}

#[tokio::test]
async fn test_iteration_cap() {
    let looping = tool_calls(vec![ToolCall::with_id(
        "call_loop",
        "list_dir",
        json!({}),
    )]);
    let client = ScriptedClient {
        fallback: Some(looping),
        ..Default::default()
    };
    let config = AgentConfig {
        max_iterations: 3,
        ..Default::default()
    };
    let f = fixture(client, config);

    let err = f
        .orchestrator
        .converse("s1", "loop forever", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Agent(AgentError::IterationLimitExceeded { max_iterations: 3 })
    ));
    assert_eq!(f.client.calls(), 3);

    // user + 3 x (assistant + tool), all still valid
    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 7);
    assert_tool_ids_paired(&messages);
}

#[tokio::test]
async fn test_stream_iteration_cap() {
    let looping = || {
        chunks(vec![
            LlmStreamChunk {
                tool_calls: vec![ToolCallFragment {
                    index: 0,
                    id: Some("call_loop".to_string()),
                    name: Some("list_dir".to_string()),
                    arguments: "{}".to_string(),
                }],
                ..Default::default()
            },
            LlmStreamChunk::finished(Some(FinishReason::ToolCalls), None),
        ])
    };
    let client = ScriptedClient::with_streams(vec![looping(), looping(), looping()]);
    let config = AgentConfig {
        max_iterations: 3,
        ..Default::default()
    };
    let f = fixture(client, config);

    let stream = f
        .orchestrator
        .stream_converse("s1", "loop forever", CancellationToken::new())
        .await
        .unwrap();
    let err = stream.finish().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Agent(AgentError::IterationLimitExceeded { max_iterations: 3 })
    ));
    assert_eq!(f.client.calls(), 3);

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 7);
    assert!(messages.iter().all(|m| m.finished));
    assert_tool_ids_paired(&messages);
}

#[tokio::test]
async fn test_write_file_records_file_change() {
    let client = ScriptedClient::with_responses(vec![
        tool_calls(vec![ToolCall::with_id(
            "call_w",
            "write_file",
            json!({"file_path": "main.go", "content": "package main\n\nfunc main() {}\n"}),
        )]),
        tool_calls(vec![ToolCall::with_id(
            "call_w2",
            "write_file",
            json!({"file_path": "main.go", "content": "package main\n\nfunc main() {}\n"}),
        )]),
        text("Added a main function."),
    ]);
    let f = fixture(client, AgentConfig::default());

    f.orchestrator
        .converse("s1", "add a main func", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(f.dir.path().join("main.go")).unwrap(),
        "package main\n\nfunc main() {}\n"
    );

    // The second, identical write is a no-op and records nothing
    let changes = f.store.list_file_changes("s1").unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].operation, FileOperation::Modify);
    assert_eq!(changes[0].file_path, "main.go");
    assert_eq!(changes[0].old_content.as_deref(), Some("package main\n"));
    assert!(changes[0].diff.contains("+func main() {}"));
}

#[tokio::test]
async fn test_history_and_system_prompt() {
    let client = ScriptedClient::with_responses(vec![text("first"), text("second")]);
    let config = AgentConfig {
        system_prompt: Some("You are a careful coding assistant.".to_string()),
        ..Default::default()
    };
    let f = fixture(client, config);
    let cancel = CancellationToken::new();

    f.orchestrator.converse("s1", "hello", &cancel).await.unwrap();
    f.orchestrator.converse("s1", "again", &cancel).await.unwrap();

    let second = f.client.request(1);
    let roles: Vec<MessageRole> = second.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User
        ]
    );
    assert_eq!(second[2].content, "first");

    // The system prompt is never stored
    let stored = f.store.list_messages("s1").unwrap();
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|m| m.role != MessageRole::System));
}

#[tokio::test]
async fn test_transport_error_keeps_user_message() {
    let client = ScriptedClient {
        responses: Mutex::new(VecDeque::from(vec![Err(LlmError::Transport {
            status: 503,
            body: "{\"error\":\"overloaded\"}".to_string(),
        }
        .into())])),
        ..Default::default()
    };
    let f = fixture(client, AgentConfig::default());

    let err = f
        .orchestrator
        .converse("s1", "hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Llm(LlmError::Transport { status: 503, .. })
    ));

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn test_cancelled_before_call() {
    let f = fixture(ScriptedClient::default(), AgentConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = f.orchestrator.converse("s1", "hi", &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(f.client.calls(), 0);
}

#[tokio::test]
async fn test_stream_text_turn() {
    let client = ScriptedClient::with_streams(vec![chunks(vec![
        LlmStreamChunk::text("Hel"),
        LlmStreamChunk::text("lo"),
        LlmStreamChunk::finished(Some(FinishReason::Stop), Some(Usage::new(9, 2))),
    ])]);
    let f = fixture(client, AgentConfig::default());

    let mut stream = f
        .orchestrator
        .stream_converse("s1", "greet me", CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    while let Some(delta) = stream.next().await {
        deltas.push(delta);
    }
    assert_eq!(deltas, vec!["Hel", "lo"]);
    assert_eq!(stream.finish().await.unwrap(), "Hello");

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hello");
    assert!(messages[1].finished);
    assert_eq!(messages[1].model.as_deref(), Some(MODEL));

    let session = f.store.get_session("s1").unwrap().unwrap();
    assert_eq!(session.message_count, 2);
    assert_eq!(session.prompt_tokens, 9);
}

#[tokio::test]
async fn test_stream_tool_loop() {
    let client = ScriptedClient::with_streams(vec![
        chunks(vec![
            LlmStreamChunk {
                tool_calls: vec![ToolCallFragment {
                    index: 0,
                    id: Some("call_s".to_string()),
                    name: Some("list_dir".to_string()),
                    arguments: "{\"dir_".to_string(),
                }],
                ..Default::default()
            },
            LlmStreamChunk {
                tool_calls: vec![ToolCallFragment {
                    index: 0,
                    arguments: "path\":\".\"}".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            LlmStreamChunk::finished(Some(FinishReason::ToolCalls), None),
        ]),
        chunks(vec![
            LlmStreamChunk::text("Two files."),
            LlmStreamChunk::finished(Some(FinishReason::Stop), None),
        ]),
    ]);
    let f = fixture(client, AgentConfig::default());

    let stream = f
        .orchestrator
        .stream_converse("s1", "list files in .", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.finish().await.unwrap(), "Two files.");

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].tool_calls[0].id, "call_s");
    assert_eq!(messages[1].tool_calls[0].arguments, json!({"dir_path": "."}));
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_s"));
    assert!(messages[2].content.contains("main.go"));
    assert_tool_ids_paired(&messages);
}

#[tokio::test]
async fn test_stream_cancellation_marks_message_incomplete() {
    let stalled: ChunkStream = Box::pin(
        futures::stream::iter(vec![LlmStreamChunk::text("partial")])
            .chain(futures::stream::pending()),
    );
    let client = ScriptedClient::with_streams(vec![stalled]);
    let f = fixture(client, AgentConfig::default());

    let mut stream = f
        .orchestrator
        .stream_converse("s1", "write an essay", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stream.next().await.as_deref(), Some("partial"));
    stream.cancel();

    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("channel did not close after cancel");
    assert!(end.is_none());
    assert!(stream.finish().await.unwrap_err().is_cancelled());

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "partial");
    assert!(!messages[1].finished);
}

#[tokio::test]
async fn test_stream_diagnostic_ends_turn() {
    let client = ScriptedClient::with_streams(vec![chunks(vec![
        LlmStreamChunk::text("abc"),
        LlmStreamChunk::diagnostic("[Error parsing response: expected value at line 1 column 1]"),
    ])]);
    let f = fixture(client, AgentConfig::default());

    let mut stream = f
        .orchestrator
        .stream_converse("s1", "hi", CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    while let Some(delta) = stream.next().await {
        deltas.push(delta);
    }
    assert_eq!(deltas.len(), 2);
    assert!(deltas[1].starts_with("[Error parsing response:"));

    let err = stream.finish().await.unwrap_err();
    assert!(matches!(err, Error::Llm(LlmError::Protocol { .. })));

    let messages = f.store.list_messages("s1").unwrap();
    assert_eq!(messages[1].content, "abc");
    assert!(!messages[1].finished);
}

#[tokio::test]
async fn test_incomplete_messages_are_not_replayed() {
    let stalled: ChunkStream = Box::pin(
        futures::stream::iter(vec![LlmStreamChunk::text("half")]).chain(futures::stream::pending()),
    );
    let client = ScriptedClient {
        streams: Mutex::new(VecDeque::from(vec![stalled])),
        responses: Mutex::new(VecDeque::from(vec![Ok(text("whole"))])),
        ..Default::default()
    };
    let f = fixture(client, AgentConfig::default());

    let mut stream = f
        .orchestrator
        .stream_converse("s1", "one", CancellationToken::new())
        .await
        .unwrap();
    stream.next().await;
    stream.cancel();
    let _ = stream.finish().await;

    f.orchestrator
        .converse("s1", "two", &CancellationToken::new())
        .await
        .unwrap();

    let replayed = f.client.request(1);
    assert!(replayed.iter().all(|m| m.content != "half"));
    assert_eq!(replayed.len(), 2);
}

#[tokio::test]
async fn test_same_session_cannot_be_driven_twice() {
    let stalled: ChunkStream = Box::pin(futures::stream::pending());
    let client = ScriptedClient {
        streams: Mutex::new(VecDeque::from(vec![stalled])),
        responses: Mutex::new(VecDeque::from(vec![Ok(text("other session"))])),
        ..Default::default()
    };
    let f = fixture(client, AgentConfig::default());

    let stream = f
        .orchestrator
        .stream_converse("busy", "first", CancellationToken::new())
        .await
        .unwrap();

    let err = f
        .orchestrator
        .converse("busy", "second", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Agent(AgentError::SessionBusy { .. })));

    // A different session is unaffected
    f.orchestrator
        .converse("free", "hello", &CancellationToken::new())
        .await
        .unwrap();

    stream.cancel();
    assert!(stream.finish().await.unwrap_err().is_cancelled());

    // Released once the stream is done
    assert_eq!(f.store.list_messages("busy").unwrap().len(), 1);
}

#[test]
fn test_session_title_truncates() {
    assert_eq!(session_title("  list files in .  "), "list files in .");
    let long = "x".repeat(80);
    let title = session_title(&long);
    assert_eq!(title.chars().count(), 53);
    assert!(title.ends_with("..."));
}
