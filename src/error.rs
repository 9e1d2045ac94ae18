use thiserror::Error;

/// Errors surfaced by the chat client core
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Message {0} has not failed, nothing to retry")]
    NotFailed(String),

    #[error("Message {id} already used {attempts} send attempts")]
    RetryLimitExceeded { id: String, attempts: u32 },

    #[error("Not joined to conversation {0}")]
    NotJoined(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("History fetch failed: {0}")]
    History(String),

    #[error("Cache entry does not match its schema: {0}")]
    CacheSchema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
