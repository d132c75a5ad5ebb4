//! Error types for the replication engine
//!
//! Classification matters: the supervisor retries source-unavailability
//! forever, skips destination syntax errors on forwarded DDL, and treats
//! everything else as fatal for the worker.

use thiserror::Error;

/// Errors raised by the replication engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source server is not configured for row-based replication.
    ///
    /// Carries the human-readable requirement for every missing or
    /// misconfigured variable.
    #[error("illegal MySQL variables, the engine requires {}", .missing.join(", "))]
    IllegalSourceVariable { missing: Vec<String> },

    /// The source cannot be reached or dropped the connection.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The destination failed to parse a forwarded DDL statement.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A forwarded DDL statement failed for a non-syntax reason.
    #[error("DDL execution failed: {0}")]
    Ddl(String),

    /// An internal invariant was broken. Always a bug.
    #[error("logical error: {0}")]
    Logical(String),

    /// The destination table carries a column kind the translator cannot fill.
    #[error("unsupported column type: {0}")]
    UnsupportedColumnType(String),

    /// Destination catalog or insert pipeline error.
    #[error("destination error: {0}")]
    Destination(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Synchronization was cancelled while an operation was in flight.
    #[error("synchronization cancelled")]
    Cancelled,

    /// I/O error (metadata persistence).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (metadata serialization).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a source-unavailable error.
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a syntax error.
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    /// Create a DDL error.
    pub fn ddl(msg: impl Into<String>) -> Self {
        Self::Ddl(msg.into())
    }

    /// Create a logical error.
    pub fn logical(msg: impl Into<String>) -> Self {
        Self::Logical(msg.into())
    }

    /// Create an unsupported-column-type error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedColumnType(msg.into())
    }

    /// Create a destination error.
    pub fn destination(msg: impl Into<String>) -> Self {
        Self::Destination(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Only source unavailability (and connection-flavored I/O) is retried;
    /// all other errors are fatal for the worker.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SourceUnavailable(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
