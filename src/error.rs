//! Error types for music-dl
//!
//! This module provides the error taxonomy for the library:
//! - Domain-specific error types (task state, storage, catalog, database)
//! - Transient vs. permanent classification lives in [`crate::retry`]
//! - Context information (task ID, job ID, file path) carried in each variant

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for music-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for music-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "schedule.cron")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Task or job state error
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Final placement of a downloaded file failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upstream catalog call failed
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The signed play URL expired and no fresh one could be resolved
    #[error("Download URL expired for task {task_id}")]
    UrlExpired {
        /// The task whose URL expired
        task_id: i64,
    },

    /// Unexpected HTTP status from an audio or artwork host
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Operation not supported (source type without a listing, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be interpreted
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Task and job state errors
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task not found in the database
    #[error("task {id} not found")]
    NotFound {
        /// The task ID that was not found
        id: i64,
    },

    /// Job not found in the database
    #[error("job {id} not found")]
    JobNotFound {
        /// The job ID that was not found
        id: i64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "finalize")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Task lacks a field the current phase needs
    #[error("task {id} is missing {field}")]
    MissingField {
        /// The task ID
        id: i64,
        /// Name of the missing field
        field: &'static str,
    },

    /// Required progress flags were not all set after the workflow ran
    #[error("task {id} incomplete: required flags {required:#b}, have {actual:#b}")]
    Incomplete {
        /// The task ID
        id: i64,
        /// Flags the job configuration requires
        required: i64,
        /// Flags actually recorded
        actual: i64,
    },

    /// Waited too long for a task to reach a terminal status
    #[error("timed out after {waited:?} waiting for task {id}")]
    Timeout {
        /// The task ID
        id: i64,
        /// How long the caller waited
        waited: std::time::Duration,
    },
}

/// File placement errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The downloaded temp file is gone
    #[error("Temporary file not found: {path}")]
    TempFileMissing {
        /// Expected temp file location
        path: PathBuf,
    },

    /// File move/rename failed
    #[error("failed to move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the file being moved
        source_path: PathBuf,
        /// The destination path where the file should be moved
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// File collision at destination
    #[error("file collision at {path}: {reason}")]
    FileCollision {
        /// The path where the collision occurred
        path: PathBuf,
        /// The reason for the collision (e.g., "file already exists")
        reason: String,
    },

    /// Invalid path encountered while computing a destination
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// The invalid path that was encountered
        path: PathBuf,
        /// The reason the path is invalid
        reason: String,
    },
}

/// Catalog gateway errors
///
/// Rate-limit and server-error signals are kept distinct from "not found" so scanners
/// can retry the former and give up on the latter.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// Upstream asked us to slow down
    #[error("rate limited by catalog")]
    RateLimited,

    /// Upstream returned a server-side failure
    #[error("catalog server error (status {status})")]
    Server {
        /// Status code reported by the upstream
        status: u16,
    },

    /// The requested resource does not exist
    #[error("{kind} {id} not found in catalog")]
    NotFound {
        /// Resource kind (song, playlist, play url)
        kind: &'static str,
        /// Resource identifier
        id: String,
    },

    /// The track exists but has no playable URL (region lock, takedown)
    #[error("track {id} is unavailable")]
    Unavailable {
        /// Track identifier
        id: String,
    },

    /// The gateway has no implementation for this call
    #[error("catalog does not support {operation}")]
    NotSupported {
        /// The unsupported call, e.g. "album listing"
        operation: &'static str,
    },

    /// Anything else the gateway reports
    #[error("{0}")]
    Other(String),
}
