//! Application error types for record-sync
//!
//! This module defines the error types used throughout the crate.
//! All error types use `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error from the async connection wrapper
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Stored record payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

impl DbError {
    /// Returns true if the underlying connection is gone
    ///
    /// A lost connection means no further write in the current pass can
    /// succeed, so it is treated as pass-fatal rather than item-level.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            DbError::Connection(tokio_rusqlite::Error::ConnectionClosed)
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Synchronization-related errors
///
/// Covers upstream failures, pass-level storage failures and cancellation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// Record store failure that aborts the pass
    #[error("Storage error: {0}")]
    Storage(String),

    /// The pass was cancelled
    #[error("Sync cancelled")]
    Cancelled,

    /// Retryable failures persisted through every allowed attempt
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last: Box<SyncError>,
    },
}

impl SyncError {
    /// Upstream hint for how long to wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Item-level transform errors
///
/// These never abort a pass; the offending item is counted and skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    /// Upstream item is not a JSON object
    #[error("Item is not an object")]
    NotAnObject,

    /// A required field is missing or null
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A key field holds a value that cannot form a natural key
    #[error("Invalid key field {field}: {reason}")]
    InvalidKey {
        /// Field name
        field: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Orchestrator errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    /// Neither a composite plan nor a registered job
    #[error("Unknown sync type: {0}")]
    UnknownSyncType(String),

    /// The job or composite is already running
    #[error("Sync already running: {0}")]
    AlreadyRunning(String),

    /// Another composite that must not overlap is running
    #[error("Cannot start {requested} while {running} is running")]
    CompositeConflict {
        /// Composite that was requested
        requested: String,
        /// Composite currently holding the guard
        running: String,
    },

    /// A job in the run returned an error
    #[error("Job {job} failed: {source}")]
    JobFailed {
        /// Job name
        job: String,
        /// Error returned by the job
        source: SyncError,
    },

    /// The plan only runs scoped to a year and none was given
    #[error("Sync type {0} requires a year")]
    YearRequired(String),

    /// The composite run was cancelled between jobs
    #[error("Sync cancelled: {0}")]
    Cancelled(String),
}

/// Application-level error type
///
/// Aggregates the domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Orchestrator error
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited(_) => true,
            SyncError::ServerError(429) => true,
            SyncError::Network(msg) | SyncError::InvalidData(msg) => mentions_rate_limit(msg),

            SyncError::NetworkTimeout
            | SyncError::ConnectionRefused
            | SyncError::ServerError(_)
            | SyncError::NotFound
            | SyncError::Unauthorized
            | SyncError::Storage(_)
            | SyncError::Cancelled
            | SyncError::RetriesExhausted { .. } => false,
        }
    }
}

/// Whether an error message carries a rate-limit signal
fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
}
