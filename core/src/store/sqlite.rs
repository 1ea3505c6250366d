//! SQLite-backed session store

use super::models::{
    FileChange, FileOperation, Message, MessageUpdate, NewFileChange, NewMessage, NewSession,
    Session,
};
use crate::error::{Result, StoreError};
use crate::llm::{MessageRole, Usage};
use crate::tools::ToolCall;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Embedded migrations, applied in order and recorded in `schema_migrations`
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/0001_initial.sql"))];

const SESSION_COLUMNS: &str = "id, title, model, provider, message_count, prompt_tokens, \
     completion_tokens, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, tool_calls, tool_call_id, model, \
     finished, created_at, updated_at";

const FILE_CHANGE_COLUMNS: &str =
    "id, session_id, file_path, operation, old_content, new_content, diff, created_at";

/// Durable log of sessions, messages and file changes.
///
/// Cloning shares the connection. Each write is one transaction, so a
/// message and the session counters it bumps commit together.
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened session database at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // In-memory databases report "memory" here, which is fine
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(5000))?;

        migrate(&mut conn)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    pub fn create_session(&self, new: NewSession) -> Result<Session> {
        let conn = self.lock()?;
        let now = now_millis();
        conn.execute(
            "INSERT INTO sessions (id, title, model, provider, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![new.id, new.title, new.model, new.provider, now],
        )?;
        debug!("Created session {}", new.id);
        fetch_session(&conn, &new.id)?
            .ok_or_else(|| StoreError::SessionNotFound { id: new.id }.into())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.lock()?;
        fetch_session(&conn, id)
    }

    /// All sessions, most recently updated first
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY updated_at DESC, rowid DESC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map([], session_from_row)?;

        let mut sessions = Vec::new();
        for session in rows {
            sessions.push(session?);
        }
        Ok(sessions)
    }

    /// Delete a session with its messages and file changes; false if absent
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Messages of a session in creation order
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id], RawMessage::from_row)?;

        let mut messages = Vec::new();
        for raw in rows {
            messages.push(raw?.into_message()?);
        }
        Ok(messages)
    }

    /// Append a message and bump the session counters in one transaction
    pub fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(created_at) FROM messages WHERE session_id = ?1",
            params![new.session_id],
            |row| row.get(0),
        )?;
        // Creation order must equal insertion order even if the clock steps back
        let now = now_millis();
        let created_at = latest.map_or(now, |latest| latest.max(now));

        let id = uuid::Uuid::new_v4().to_string();
        let tool_calls = encode_tool_calls(&new.tool_calls)?;

        bump_session(&tx, &new.session_id, 1, new.usage, now)?;
        tx.execute(
            "INSERT INTO messages (id, session_id, role, content, tool_calls, tool_call_id, model,
                                   finished, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                new.session_id,
                new.role.as_str(),
                new.content,
                tool_calls,
                new.tool_call_id,
                new.model,
                new.finished,
                created_at,
            ],
        )?;

        let message = fetch_message(&tx, &id)?;
        tx.commit()?;
        Ok(message)
    }

    /// Replace a message's content in place, adding any usage to its session
    pub fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        let tool_calls = encode_tool_calls(&update.tool_calls)?;

        let session_id: Option<String> = tx
            .query_row(
                "SELECT session_id FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(session_id) = session_id else {
            return Err(StoreError::MessageNotFound { id: id.to_string() }.into());
        };

        tx.execute(
            "UPDATE messages SET content = ?2, tool_calls = ?3, finished = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, update.content, tool_calls, update.finished, now],
        )?;
        bump_session(&tx, &session_id, 0, update.usage, now)?;

        let message = fetch_message(&tx, id)?;
        tx.commit()?;
        Ok(message)
    }

    pub fn record_file_change(&self, new: NewFileChange) -> Result<FileChange> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO file_changes (id, session_id, file_path, operation, old_content,
                                       new_content, diff, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.session_id,
                new.file_path,
                new.operation.as_str(),
                new.old_content,
                new.new_content,
                new.diff,
                now_millis(),
            ],
        )?;

        let raw = conn.query_row(
            &format!("SELECT {} FROM file_changes WHERE id = ?1", FILE_CHANGE_COLUMNS),
            params![id],
            RawFileChange::from_row,
        )?;
        raw.into_file_change()
    }

    pub fn list_file_changes(&self, session_id: &str) -> Result<Vec<FileChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_changes WHERE session_id = ?1 ORDER BY created_at, rowid",
            FILE_CHANGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id], RawFileChange::from_row)?;

        let mut changes = Vec::new();
        for raw in rows {
            changes.push(raw?.into_file_change()?);
        }
        Ok(changes)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_millis()],
        )?;
        tx.commit()?;
        info!("Applied database migration {}", version);
    }

    Ok(())
}

fn bump_session(
    tx: &Transaction<'_>,
    session_id: &str,
    messages: i64,
    usage: Option<Usage>,
    now: i64,
) -> Result<()> {
    let usage = usage.unwrap_or_default();
    let updated = tx.execute(
        "UPDATE sessions
         SET message_count = message_count + ?2,
             prompt_tokens = prompt_tokens + ?3,
             completion_tokens = completion_tokens + ?4,
             updated_at = MAX(updated_at, ?5)
         WHERE id = ?1",
        params![
            session_id,
            messages,
            usage.prompt_tokens as i64,
            usage.completion_tokens as i64,
            now,
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::SessionNotFound {
            id: session_id.to_string(),
        }
        .into());
    }
    Ok(())
}

fn fetch_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()?)
}

fn fetch_message(conn: &Connection, id: &str) -> Result<Message> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            params![id],
            RawMessage::from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::MessageNotFound { id: id.to_string() })?;
    raw.into_message()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        model: row.get(2)?,
        provider: row.get(3)?,
        message_count: row.get(4)?,
        prompt_tokens: row.get(5)?,
        completion_tokens: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
    })
}

/// Message columns before JSON and enum decoding
struct RawMessage {
    id: String,
    session_id: String,
    role: String,
    content: String,
    tool_calls: Option<String>,
    tool_call_id: Option<String>,
    model: Option<String>,
    finished: bool,
    created_at: i64,
    updated_at: i64,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            tool_calls: row.get(4)?,
            tool_call_id: row.get(5)?,
            model: row.get(6)?,
            finished: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role: MessageRole = self.role.parse().map_err(|e: String| StoreError::Corrupt {
            id: self.id.clone(),
            message: e,
        })?;
        let tool_calls: Vec<ToolCall> = match self.tool_calls.as_deref() {
            None | Some("") => Vec::new(),
            Some(json) => serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
                id: self.id.clone(),
                message: format!("invalid tool_calls: {}", e),
            })?,
        };

        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            role,
            content: self.content,
            tool_calls,
            tool_call_id: self.tool_call_id,
            model: self.model,
            finished: self.finished,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

struct RawFileChange {
    id: String,
    session_id: String,
    file_path: String,
    operation: String,
    old_content: Option<String>,
    new_content: Option<String>,
    diff: String,
    created_at: i64,
}

impl RawFileChange {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            file_path: row.get(2)?,
            operation: row.get(3)?,
            old_content: row.get(4)?,
            new_content: row.get(5)?,
            diff: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_file_change(self) -> Result<FileChange> {
        let operation: FileOperation =
            self.operation
                .parse()
                .map_err(|e: String| StoreError::Corrupt {
                    id: self.id.clone(),
                    message: e,
                })?;

        Ok(FileChange {
            id: self.id,
            session_id: self.session_id,
            file_path: self.file_path,
            operation,
            old_content: self.old_content,
            new_content: self.new_content,
            diff: self.diff,
            created_at: from_millis(self.created_at),
        })
    }
}

fn encode_tool_calls(tool_calls: &[ToolCall]) -> Result<Option<String>> {
    if tool_calls.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(tool_calls)?))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
