pub mod cache;
pub mod codec;
pub mod command;
pub mod demo;
pub mod engine;
pub mod entry;
pub mod error;
pub mod jobs;

pub use command::Command;
pub use engine::{EngineOptions, HistoryRecord, SharedCommand, UndoEngine};
pub use entry::{BackupCursor, HistoryEntry};
pub use error::UndoError;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, UndoError>;
