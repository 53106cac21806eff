//! Error types for the triage engine

use thiserror::Error;

/// Result type alias for triage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the triage engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session lifecycle error
    #[error("session error: {0}")]
    Session(String),

    /// No live session registered for a tenant
    #[error("session not initialized for tenant {0}")]
    SessionNotInitialized(i64),

    /// Protocol bridge error (connect, send, poll)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Media download failed after exhausting retries
    #[error("media download failed: {0}")]
    MediaDownload(String),

    /// Another open or pending ticket already exists for the contact
    #[error("contact already has an open ticket (queue: {queue}, agent: {agent})")]
    TicketConflict {
        /// Queue name of the blocking ticket, or "-"
        queue: String,
        /// Agent name of the blocking ticket, or "-"
        agent: String,
    },

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
