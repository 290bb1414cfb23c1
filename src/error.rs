use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Content does not match sha1 hash {claimed} (computed {actual})")]
    Integrity { claimed: String, actual: String },

    #[error("Sync made no progress after {rounds} rounds")]
    NoProgress { rounds: usize },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid delta: {0}")]
    Delta(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
