//! Tools listing command

use anyhow::{Context, Result};
use colored::Colorize;
use omnitrix_core::tools::{ToolRegistry, WorkingRoot};
use tracing::info;

use crate::config::CliConfigLoader;

/// Show the tools the model is offered
pub async fn tools_command(loader: CliConfigLoader) -> Result<()> {
    info!("Listing available tools");

    let config = loader.load().await?;
    let root = WorkingRoot::new(config.working_dir())
        .with_context(|| format!("Invalid working directory: {}", config.working_dir().display()))?;
    let registry = ToolRegistry::with_builtins(&root, &config.tools)?;

    println!("Available tools (working root: {})\n", root.path().display());
    for definition in registry.definitions() {
        let function = definition.function;
        println!("{}", function.name.bold());
        // First line of the description only
        let summary = function.description.lines().next().unwrap_or_default();
        println!("    {}", summary);

        let required: Vec<&str> = function
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if let Some(properties) = function.parameters.get("properties").and_then(|p| p.as_object()) {
            for name in properties.keys() {
                let marker = if required.contains(&name.as_str()) { "*" } else { "" };
                println!("      {}{}", name.dimmed(), marker);
            }
        }
        println!();
    }

    Ok(())
}
