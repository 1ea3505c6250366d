//! Tool registry for managing available tools

use crate::error::{Result, ToolError};
use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::tools::builtin::{ListDirTool, ReadFileTool, WorkingRoot, WriteFileTool};
use crate::tools::{normalize_integers, validate_arguments, Tool, ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Name-keyed catalog of callable tools
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in filesystem tools.
    ///
    /// `enabled` filters by name; an empty list enables every built-in.
    /// Unknown names are rejected so a typo in configuration is not silent.
    pub fn with_builtins(root: &WorkingRoot, enabled: &[String]) -> Result<Self> {
        let builtins: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFileTool::new(root.clone())),
            Arc::new(WriteFileTool::new(root.clone())),
            Arc::new(ListDirTool::new(root.clone())),
        ];

        for name in enabled {
            if !builtins.iter().any(|tool| tool.name() == name) {
                return Err(ToolError::UnknownTool { name: name.clone() }.into());
            }
        }

        let mut registry = Self::new();
        for tool in builtins {
            if enabled.is_empty() || enabled.iter().any(|name| name == tool.name()) {
                registry.register(tool);
            }
        }
        Ok(registry)
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by exact name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names
    pub fn list_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Catalog sent to the model, sorted by name so it is stable across calls
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list_tools()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute a tool call.
    ///
    /// Never fails: unknown tools, invalid arguments, execution errors and
    /// cancellation all come back as an error result addressed to the call.
    pub async fn execute(&self, call: ToolCall, cancel: &CancellationToken) -> ToolResult {
        let start = Instant::now();
        let call_id = call.id.clone();

        let Some(tool) = self.get(&call.name) else {
            warn!("Model requested unknown tool '{}'", call.name);
            let err = ToolError::UnknownTool {
                name: call.name.clone(),
            };
            return ToolResult::error(
                &call_id,
                format!("{}. Available tools: {}", err, self.list_tools().join(", ")),
            );
        };

        let schema = tool.parameters_schema();
        if let Err(err) = validate_arguments(&schema, &call.arguments) {
            warn!("Rejected arguments for {}: {}", call.name, err);
            return ToolResult::error(&call_id, err.to_string());
        }
        let mut call = call;
        normalize_integers(&schema, &mut call.arguments);

        debug!("Executing tool {} ({})", call.name, call_id);
        let name = call.name.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolResult::error(&call_id, "operation cancelled")
                    .with_duration(start.elapsed().as_millis() as u64);
            }
            outcome = tool.execute(call) => outcome,
        };

        let result = match outcome {
            Ok(mut result) => {
                // The result is always addressed to the call that produced it
                result.tool_call_id = call_id;
                result
            }
            Err(err) => {
                warn!("Tool {} failed: {}", name, err);
                ToolResult::error(&call_id, tool_error_message(err))
            }
        };

        result.with_duration(start.elapsed().as_millis() as u64)
    }
}

/// Tool errors read better without the crate-level prefix
fn tool_error_message(err: crate::error::Error) -> String {
    match err {
        crate::error::Error::Tool(tool_err) => tool_err.to_string(),
        other => other.to_string(),
    }
}
