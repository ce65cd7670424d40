use thiserror::Error;

#[derive(Error, Debug)]
pub enum UndoError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup data error: {0}")]
    BackupData(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
