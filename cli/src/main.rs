//! # omnitrix CLI
//!
//! Command-line interface for omnitrix - a local coding agent.
//!
//! ## Usage
//!
//! - `omnitrix` - Start an interactive session
//! - `omnitrix "task description"` - Run a single turn
//! - `omnitrix sessions` - List stored sessions
//! - `omnitrix history <id>` - Print a session transcript
//! - `omnitrix delete <id>` - Delete a session
//! - `omnitrix tools` - Show available tools

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use commands::{
    delete_command, history_command, interactive_command, run_command, sessions_command,
    tools_command, ChatOptions,
};
use config::CliConfigLoader;

/// omnitrix - A local coding agent
#[derive(Parser)]
#[command(name = "omnitrix")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A local coding agent with pluggable LLM backends")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file or directory path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Provider id (ollama, openai, or one defined in the config file)
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model name override
    #[arg(long, global = true)]
    model: Option<String>,

    /// Base URL override for the selected provider
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// API key override for the selected provider
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Root directory the tools may access
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    /// Directory holding the session database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum model round-trips per turn
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Resume an existing session
    #[arg(short, long)]
    session: Option<String>,

    /// Wait for the whole answer instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// The prompt to run (if provided, runs a single turn)
    prompt: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored sessions
    Sessions,

    /// Print the transcript of a session
    History {
        /// Session id
        id: String,
    },

    /// Delete a session and everything recorded for it
    Delete {
        /// Session id
        id: String,
    },

    /// Show available tools
    Tools,
}

/// Build a configuration loader from CLI arguments
fn build_config_loader(cli: &Cli) -> CliConfigLoader {
    let mut loader = CliConfigLoader::new();

    if let Some(config_path) = &cli.config {
        loader = loader.with_config_override(config_path.clone());
    }

    if let Some(provider) = &cli.provider {
        loader = loader.with_provider_override(provider.clone());
    }

    if let Some(model) = &cli.model {
        loader = loader.with_model_override(model.clone());
    }

    if let Some(base_url) = &cli.base_url {
        loader = loader.with_base_url_override(base_url.clone());
    }

    if let Some(api_key) = &cli.api_key {
        loader = loader.with_api_key_override(api_key.clone());
    }

    if let Some(working_dir) = &cli.working_dir {
        loader = loader.with_working_dir_override(working_dir.clone());
    }

    if let Some(data_dir) = &cli.data_dir {
        loader = loader.with_data_dir_override(data_dir.clone());
    }

    if let Some(max_iterations) = cli.max_iterations {
        loader = loader.with_max_iterations_override(max_iterations);
    }

    loader
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    omnitrix_core::init_tracing_with_debug(cli.verbose);

    let config_loader = build_config_loader(&cli);
    let options = ChatOptions {
        session: cli.session,
        no_stream: cli.no_stream,
    };

    match (cli.prompt, cli.command) {
        (Some(prompt), None) => run_command(prompt, config_loader, options).await,
        (Some(_), Some(_)) => {
            anyhow::bail!("Cannot specify both a prompt and a subcommand")
        }
        (None, Some(Commands::Sessions)) => sessions_command(config_loader).await,
        (None, Some(Commands::History { id })) => history_command(config_loader, id).await,
        (None, Some(Commands::Delete { id })) => delete_command(config_loader, id).await,
        (None, Some(Commands::Tools)) => tools_command(config_loader).await,
        (None, None) => interactive_command(config_loader, options).await,
    }
}
