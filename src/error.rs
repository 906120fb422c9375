//! Centralized error types for mboxsync.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mboxsync library.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified archive file does not exist.
    #[error("Archive file not found: {0}")]
    FileNotFound(PathBuf),

    /// The HTTP request for an archive unit could not be completed.
    #[error("Download of {unit} failed: {reason}")]
    Fetch { unit: String, reason: String },

    /// The archive server answered with a non-success status.
    #[error("Download of {unit} failed: HTTP {status}")]
    HttpStatus { unit: String, status: u16 },

    /// HTTP client setup or transport error outside a specific unit.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A persistent store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// No thread matches the given id or id prefix.
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    /// A short id prefix matches more than one thread.
    #[error("Thread id prefix '{0}' is ambiguous: {1} matches")]
    AmbiguousId(String, usize),

    /// An ingestion run is already active.
    #[error("An ingestion run is already in progress")]
    AlreadyRunning,

    /// A background task failed before producing a result.
    #[error("Background task failed: {0}")]
    Task(String),

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Convenience alias for `Result<T, SyncError>`.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Fetch` variant for a unit label.
    pub fn fetch(unit: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Fetch {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `SyncError::io`).
impl From<std::io::Error> for SyncError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
