//! Persistence for sessions, messages and file changes

pub mod models;
pub mod sqlite;

pub use models::{
    FileChange, FileOperation, Message, MessageUpdate, NewFileChange, NewMessage, NewSession,
    Session,
};
pub use sqlite::Store;
