//! Persisted records

use crate::llm::{LlmMessage, MessageRole, Usage};
use crate::tools::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub model: String,
    pub provider: String,
    pub message_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a session about to be created
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub title: String,
    pub model: String,
    pub provider: String,
}

/// One persisted turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Set only on tool-role messages
    pub tool_call_id: Option<String>,
    pub model: Option<String>,
    /// False while a streamed message is still accumulating, and forever
    /// after if the stream was interrupted
    pub finished: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// The message as sent to a provider
    pub fn to_llm_message(&self) -> LlmMessage {
        LlmMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

/// Values for a message about to be appended
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub model: Option<String>,
    pub finished: bool,
    /// Token usage of the model response this message records
    pub usage: Option<Usage>,
}

impl NewMessage {
    /// A finished message built from a transcript entry
    pub fn from_llm(session_id: &str, message: &LlmMessage) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            model: None,
            finished: true,
            usage: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn unfinished(mut self) -> Self {
        self.finished = false;
        self
    }
}

/// In-place update of a streamed message
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finished: bool,
    pub usage: Option<Usage>,
}

/// Kind of filesystem edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Create => "create",
            FileOperation::Modify => "modify",
            FileOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(FileOperation::Create),
            "modify" => Ok(FileOperation::Modify),
            "delete" => Ok(FileOperation::Delete),
            other => Err(format!("unknown file operation: {}", other)),
        }
    }
}

/// A recorded edit made during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub id: String,
    pub session_id: String,
    pub file_path: String,
    pub operation: FileOperation,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    /// Unified diff between old and new content
    pub diff: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFileChange {
    pub session_id: String,
    pub file_path: String,
    pub operation: FileOperation,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    pub diff: String,
}
