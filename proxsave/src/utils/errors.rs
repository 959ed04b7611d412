//! Custom error types for the snapshot engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Command '{command}' failed (exit {code}): {summary}")]
    Command {
        command: String,
        code: i32,
        summary: String,
    },

    #[error("Failed to start '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("{algorithm} compression failed: {message}")]
    Compressor { algorithm: String, message: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Archive verification failed: {0}")]
    Verification(String),

    #[error("Chunk error: {0}")]
    Chunk(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// True when the error is the caller's cancellation surfacing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
