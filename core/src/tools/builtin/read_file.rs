//! File reading tool

use super::path::WorkingRoot;
use crate::error::{Result, ToolError};
use crate::tools::{Tool, ToolCall, ToolResult};
use async_trait::async_trait;
use serde_json::json;

/// Largest file the tool will return
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Reads a text file inside the working root, annotated with line numbers
pub struct ReadFileTool {
    root: WorkingRoot,
    max_size: u64,
}

impl ReadFileTool {
    pub fn new(root: WorkingRoot) -> Self {
        Self {
            root,
            max_size: MAX_FILE_SIZE,
        }
    }

    /// Override the size limit
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file from the filesystem. Use this to examine source code, \
         configuration files, or any text-based files.\n\
         \n\
         Usage:\n\
         - Provide the file path (relative to working directory or absolute)\n\
         - Optionally specify line range to read partial content\n\
         \n\
         The tool will return the file contents with line numbers for easy reference."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read (relative or absolute)"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: Line number to start reading from (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: Line number to stop reading at (inclusive)"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        let file_path: String = call.get_parameter("file_path")?;
        let start_line: Option<i64> = call.get_optional("start_line")?;
        let end_line: Option<i64> = call.get_optional("end_line")?;

        // Containment is checked first, then the range, then the filesystem
        let path = self.root.resolve(&file_path)?;
        let start = start_line.unwrap_or(1);
        if start < 1 {
            return Err(ToolError::Validation {
                message: format!("start_line must be >= 1, got {}", start),
            }
            .into());
        }
        if let Some(end) = end_line {
            if end < 1 {
                return Err(ToolError::Validation {
                    message: format!("end_line must be >= 1, got {}", end),
                }
                .into());
            }
            if start > end {
                return Err(ToolError::Validation {
                    message: format!("start_line ({}) must be <= end_line ({})", start, end),
                }
                .into());
            }
        }

        let display = self.root.display_path(&path);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound { path: file_path }.into())
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            return Err(ToolError::Validation {
                message: format!("path is a directory, not a file: {}", display),
            }
            .into());
        }

        if metadata.len() > self.max_size {
            return Err(ToolError::TooLarge {
                size: metadata.len(),
                max: self.max_size,
            }
            .into());
        }

        let bytes = tokio::fs::read(&path).await?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        if total == 0 {
            return Ok(ToolResult::success(
                &call.id,
                format!("File: {}\nLines: 0-0 of 0\n\n(empty file)\n", display),
            ));
        }

        let start = start as usize;
        let end = end_line.map_or(total, |end| (end as usize).min(total));

        if start > total {
            return Err(ToolError::Validation {
                message: format!(
                    "start_line ({}) is beyond the end of the file ({} lines)",
                    start, total
                ),
            }
            .into());
        }

        Ok(ToolResult::success(&call.id, format_lines(&display, &lines, start, end)))
    }
}

fn format_lines(display: &str, lines: &[&str], start: usize, end: usize) -> String {
    let mut output = format!(
        "File: {}\nLines: {}-{} of {}\n\n",
        display,
        start,
        end,
        lines.len()
    );
    for (offset, line) in lines[start - 1..end].iter().enumerate() {
        output.push_str(&format!("{:4} | {}\n", start + offset, line));
    }
    output
}
