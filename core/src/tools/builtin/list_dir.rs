//! Directory listing tool

use super::path::WorkingRoot;
use crate::error::{Result, ToolError};
use crate::tools::{Tool, ToolCall, ToolResult};
use async_trait::async_trait;
use serde_json::json;

/// Lists the immediate children of a directory inside the working root
pub struct ListDirTool {
    root: WorkingRoot,
}

impl ListDirTool {
    pub fn new(root: WorkingRoot) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory. Shows subdirectories and files separately, \
         with file sizes.\n\
         \n\
         Usage:\n\
         - Provide the directory path (relative to working directory or absolute); defaults to '.'\n\
         - Only immediate children are listed (not recursive)\n\
         - Hidden entries are skipped unless show_hidden is true"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "dir_path": {
                    "type": "string",
                    "description": "Path to the directory to list (default: '.')"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Optional: Include entries starting with '.' (default: false)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        let dir_path: String = call.get_parameter_or("dir_path", ".".to_string());
        let show_hidden: bool = call.get_parameter_or("show_hidden", false);

        let path = self.root.resolve(&dir_path)?;
        let display = self.root.display_path(&path);

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(ToolError::Validation {
                    message: format!("path is not a directory: {}", display),
                }
                .into())
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound { path: dir_path }.into())
            }
            Err(e) => return Err(e.into()),
        }

        let mut dirs = Vec::new();
        let mut files = Vec::new();

        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            // Follows symlinks; a dangling link is listed as a zero-size file
            match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_dir() => dirs.push(name),
                Ok(metadata) => files.push((name, metadata.len())),
                Err(_) => files.push((name, 0)),
            }
        }

        dirs.sort();
        files.sort();

        Ok(ToolResult::success(&call.id, format_listing(&display, &dirs, &files)))
    }
}

fn format_listing(display: &str, dirs: &[String], files: &[(String, u64)]) -> String {
    let mut output = format!(
        "Directory: {}\nEntries: {}\n\n",
        display,
        dirs.len() + files.len()
    );

    if !dirs.is_empty() {
        output.push_str("Directories:\n");
        for dir in dirs {
            output.push_str(&format!("  {}/\n", dir));
        }
        output.push('\n');
    }

    if !files.is_empty() {
        output.push_str("Files:\n");
        for (name, size) in files {
            output.push_str(&format!("  {:<40} {}\n", name, format_size(*size)));
        }
    }

    if dirs.is_empty() && files.is_empty() {
        output.push_str("(empty directory)\n");
    }

    output
}

/// Human-readable size with B/KB/MB/GB units
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = bytes as f64;
    if size >= GB {
        format!("{:.1} GB", size / GB)
    } else if size >= MB {
        format!("{:.1} MB", size / MB)
    } else if size >= KB {
        format!("{:.1} KB", size / KB)
    } else {
        format!("{} B", bytes)
    }
}
