//! Tool system and built-in tools

pub mod base;
pub mod builtin;
pub mod registry;
pub mod validation;

pub use base::{Tool, ToolCall, ToolResult};
pub use builtin::WorkingRoot;
pub use registry::ToolRegistry;
pub use validation::{normalize_integers, validate_arguments};
