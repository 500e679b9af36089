//! Error types for metricvault-core
//!
//! Retryability is decided where a failure originates (SQLite result codes,
//! IO error kinds, HTTP client classification), so callers never have to
//! pattern-match on error text.

use thiserror::Error;

/// Main error type for the metricvault-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote replication error
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Checkpoint file could not be read or written
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Schema or table name that is not a plain identifier
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Partition maintenance statement failed for a specific chunk
    #[error("chunk {chunk_id} of {table}: {message}")]
    Chunk {
        table: String,
        chunk_id: i64,
        message: String,
    },
}

/// Failures raised by the remote replication client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request did not complete within its deadline
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The remote endpoint could not be reached
    #[error("connection failed: {0}")]
    Connect(String),

    /// The remote answered with a non-success status
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded
    #[error("failed to parse response: {0}")]
    Decode(String),

    /// Any other request failure
    #[error("HTTP request failed: {0}")]
    Request(String),
}

impl RemoteError {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout { .. } | RemoteError::Connect(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Decode(_) | RemoteError::Request(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout { elapsed_ms: 0 }
        } else if e.is_connect() {
            RemoteError::Connect(e.to_string())
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            RemoteError::Request(e.to_string())
        }
    }
}

impl Error {
    /// Whether the failed operation is worth retrying as-is.
    ///
    /// Transient conditions: busy or locked database files, IO timeouts and
    /// dropped connections, and retryable remote failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Remote(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for metricvault-core
pub type Result<T> = std::result::Result<T, Error>;
