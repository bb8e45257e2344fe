//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Snapshot source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid {entity} snapshot: {reason}")]
    InvalidSnapshot { entity: String, reason: String },

    #[error("Failed to write {table} batch: {reason}")]
    StoreWrite { table: String, reason: String },

    #[error("Store query failed: {0}")]
    StoreQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn invalid_snapshot(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn store_write(table: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StoreWrite {
            table: table.into(),
            reason: reason.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error came from the live queue system rather than the store.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::InvalidSnapshot { .. }
        )
    }
}
