//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed log: {0}")]
    MalformedLog(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl IndexerError {
    /// True when the store rejected a write because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedLog(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
