//! One-shot and interactive conversation commands

use anyhow::{Context, Result};
use colored::Colorize;
use futures::StreamExt;
use omnitrix_core::{AgentBuilder, AppConfig, Orchestrator, Store};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CliConfigLoader;

/// How a conversation command should run
pub struct ChatOptions {
    /// Existing session to resume; a new one is created otherwise
    pub session: Option<String>,
    /// Use the blocking call instead of streaming deltas
    pub no_stream: bool,
}

/// Run a single turn and exit
pub async fn run_command(
    prompt: String,
    loader: CliConfigLoader,
    options: ChatOptions,
) -> Result<()> {
    let config = loader.load().await?;
    let store = open_store(&config)?;
    let session_id = session_id(options.session);
    let orchestrator = build_orchestrator(&config, &loader, store, &session_id)?;

    eprintln!("{} {}", "session".dimmed(), session_id.dimmed());
    run_turn(&orchestrator, &session_id, &prompt, !options.no_stream).await
}

/// Read prompts from stdin until end of input
pub async fn interactive_command(loader: CliConfigLoader, options: ChatOptions) -> Result<()> {
    let config = loader.load().await?;
    let store = open_store(&config)?;
    let session_id = session_id(options.session);
    let orchestrator = build_orchestrator(&config, &loader, store, &session_id)?;

    println!(
        "{} {} ({})",
        "omnitrix".bold(),
        orchestrator.client().model_name().cyan(),
        orchestrator.client().provider_name()
    );
    println!(
        "{}",
        format!("session {}  /exit to quit, Ctrl-C cancels a running turn", session_id).dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".green().bold());
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt, "/exit" | "/quit") {
            break;
        }

        // A failed turn is reported and the loop goes on
        if let Err(e) = run_turn(&orchestrator, &session_id, prompt, !options.no_stream).await {
            eprintln!("{} {:#}", "error:".red().bold(), e);
        }
    }

    info!("Leaving session {}", session_id);
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Store> {
    let path = config.database_path();
    Store::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))
}

fn session_id(requested: Option<String>) -> String {
    requested.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Resumed sessions keep their provider and model unless flags say otherwise
fn build_orchestrator(
    config: &AppConfig,
    loader: &CliConfigLoader,
    store: Store,
    session_id: &str,
) -> Result<Orchestrator> {
    let mut builder = AgentBuilder::new(config.clone());
    if !loader.has_model_override() {
        if let Some(session) = store.get_session(session_id)? {
            debug!(
                "Resuming session {} with {} / {}",
                session_id, session.provider, session.model
            );
            builder = builder
                .with_provider(Some(session.provider))
                .with_model(Some(session.model));
        }
    }

    builder
        .with_store(store)
        .build()
        .context("Failed to set up the agent")
}

async fn run_turn(
    orchestrator: &Orchestrator,
    session_id: &str,
    prompt: &str,
    stream: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = cancel_on_interrupt(cancel.clone());

    let outcome = if stream {
        stream_turn(orchestrator, session_id, prompt, cancel).await
    } else {
        blocking_turn(orchestrator, session_id, prompt, &cancel).await
    };
    watcher.abort();

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            eprintln!("{}", "cancelled".yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn stream_turn(
    orchestrator: &Orchestrator,
    session_id: &str,
    prompt: &str,
    cancel: CancellationToken,
) -> omnitrix_core::Result<()> {
    let mut stream = orchestrator
        .stream_converse(session_id, prompt, cancel)
        .await?;

    let mut stdout = std::io::stdout();
    while let Some(delta) = stream.next().await {
        print!("{}", delta);
        stdout.flush()?;
    }
    println!();

    stream.finish().await.map(|_| ())
}

async fn blocking_turn(
    orchestrator: &Orchestrator,
    session_id: &str,
    prompt: &str,
    cancel: &CancellationToken,
) -> omnitrix_core::Result<()> {
    let answer = orchestrator.converse(session_id, prompt, cancel).await?;
    println!("{}", answer);
    Ok(())
}

/// Cancel the token on the first Ctrl-C
fn cancel_on_interrupt(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}
