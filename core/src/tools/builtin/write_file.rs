//! File writing tool

use super::path::WorkingRoot;
use crate::error::{Result, ToolError};
use crate::tools::{Tool, ToolCall, ToolResult};
use async_trait::async_trait;
use serde_json::json;

/// Writes a text file inside the working root.
///
/// The result carries structured data describing the change so the
/// caller can record it; the tool itself never touches the store.
pub struct WriteFileTool {
    root: WorkingRoot,
}

impl WriteFileTool {
    pub fn new(root: WorkingRoot) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it does not exist, or replaces its \
         contents if it does.\n\
         \n\
         Usage:\n\
         - Provide the file path (relative to working directory or absolute)\n\
         - Provide the complete new content of the file\n\
         - Missing parent directories are created unless create_dirs is false\n\
         \n\
         Writing content identical to the existing file is reported as a no-op."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to write (relative or absolute)"
                },
                "content": {
                    "type": "string",
                    "description": "The complete content to write to the file"
                },
                "create_dirs": {
                    "type": "boolean",
                    "description": "Optional: Create missing parent directories (default: true)"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        let file_path: String = call.get_parameter("file_path")?;
        let content: String = call.get_parameter("content")?;
        let create_dirs: bool = call.get_parameter_or("create_dirs", true);

        let path = self.root.resolve(&file_path)?;
        let display = self.root.display_path(&path);

        let existing = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                return Err(ToolError::Validation {
                    message: format!("path is a directory, not a file: {}", display),
                }
                .into())
            }
            Ok(_) => Some(tokio::fs::read(&path).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(old) = &existing {
            if old.as_slice() == content.as_bytes() {
                return Ok(ToolResult::success(
                    &call.id,
                    format!(
                        "File {} already contains the exact content. No changes made.",
                        display
                    ),
                )
                .with_data(json!({
                    "operation": "noop",
                    "path": display,
                })));
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if !create_dirs {
                    return Err(ToolError::NotFound {
                        path: self.root.display_path(parent),
                    }
                    .into());
                }
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&path, content.as_bytes()).await?;
        let new_lines = content.lines().count();

        let result = match existing {
            None => ToolResult::success(
                &call.id,
                format!("Created file: {}\nLines written: {}", display, new_lines),
            )
            .with_data(json!({
                "operation": "create",
                "path": display,
                "old_content": null,
                "new_content": content,
            })),
            Some(old) => {
                let old_content = String::from_utf8_lossy(&old).into_owned();
                let old_lines = old_content.lines().count();
                let delta = new_lines as i64 - old_lines as i64;
                ToolResult::success(
                    &call.id,
                    format!(
                        "Modified file: {}\nLines: {} -> {} ({:+})",
                        display, old_lines, new_lines, delta
                    ),
                )
                .with_data(json!({
                    "operation": "modify",
                    "path": display,
                    "old_content": old_content,
                    "new_content": content,
                }))
            }
        };

        Ok(result)
    }
}
