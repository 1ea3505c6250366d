//! Session inspection commands

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use omnitrix_core::llm::MessageRole;
use omnitrix_core::store::Message;
use omnitrix_core::Store;

use crate::config::CliConfigLoader;

async fn open_store(loader: &CliConfigLoader) -> Result<Store> {
    let config = loader.load().await?;
    let path = config.database_path();
    Store::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))
}

/// List stored sessions, most recently updated first
pub async fn sessions_command(loader: CliConfigLoader) -> Result<()> {
    let store = open_store(&loader).await?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    for session in sessions {
        println!("{}  {}", session.id.cyan(), session.title.bold());
        println!(
            "    {} / {}  {} messages  {} prompt + {} completion tokens  updated {}",
            session.provider,
            session.model,
            session.message_count,
            session.prompt_tokens,
            session.completion_tokens,
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Print the transcript of one session
pub async fn history_command(loader: CliConfigLoader, session_id: String) -> Result<()> {
    let store = open_store(&loader).await?;
    let session = store
        .get_session(&session_id)?
        .ok_or_else(|| anyhow!("Session not found: {}", session_id))?;

    println!("{} ({} / {})\n", session.title.bold(), session.provider, session.model);
    for message in store.list_messages(&session_id)? {
        print_message(&message);
    }
    Ok(())
}

/// Delete a session with its messages and file changes
pub async fn delete_command(loader: CliConfigLoader, session_id: String) -> Result<()> {
    let store = open_store(&loader).await?;
    if !store.delete_session(&session_id)? {
        return Err(anyhow!("Session not found: {}", session_id));
    }
    println!("Deleted session {}", session_id);
    Ok(())
}

fn print_message(message: &Message) {
    let label = match message.role {
        MessageRole::System => "system".dimmed(),
        MessageRole::User => "user".green().bold(),
        MessageRole::Assistant => "assistant".blue().bold(),
        MessageRole::Tool => "tool".yellow(),
    };
    let marker = if message.finished { "" } else { " (interrupted)" };
    println!("{}{}", label, marker.red());

    for call in &message.tool_calls {
        println!("  -> {}({})", call.name.cyan(), call.arguments);
    }
    if !message.content.is_empty() {
        for line in message.content.lines() {
            println!("  {}", line);
        }
    }
    println!();
}
