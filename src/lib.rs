// Re-export needed modules for testing
pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod transport;

// Re-export main types for convenience
pub use chat::{ChatServices, ChatSession, ConnectionManager, SessionSettings};
pub use error::{ChatError, Result};
pub use models::*;
