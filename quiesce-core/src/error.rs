//! Error types for quiesce-core

use thiserror::Error;

/// Main error type for the quiesce-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error from the SQLite-backed store
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error for persisted batches
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Key-value store error that is not a database error
    #[error("store error: {0}")]
    Store(String),
}

/// Result type alias for quiesce-core
pub type Result<T> = std::result::Result<T, Error>;
