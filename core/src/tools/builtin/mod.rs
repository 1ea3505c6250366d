//! Built-in filesystem tools
//!
//! Every tool resolves its paths through a shared [`WorkingRoot`], so
//! containment is enforced in one place.

pub mod list_dir;
pub mod path;
pub mod read_file;
pub mod write_file;

pub use list_dir::ListDirTool;
pub use path::WorkingRoot;
pub use read_file::{ReadFileTool, MAX_FILE_SIZE};
pub use write_file::WriteFileTool;

/// Names of every built-in tool, in catalog order
pub const BUILTIN_TOOLS: &[&str] = &["list_dir", "read_file", "write_file"];
