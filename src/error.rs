//! Unified error types for the watcher daemon.
//!
//! Runtime loops never propagate errors upward; they log and retry. The
//! variants here cover construction and conversion failures that callers can
//! meaningfully handle.

use std::io;
use thiserror::Error;

/// Unified error type for watcher operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// IO error (stat, read dir, process spawn)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server base URL failed validation
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Path conversion rejected its input
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Ignore filter could not be built from the project's glob lists
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Changed-file entry constructor rejected its input
    #[error("Invalid changed entry value: {0}")]
    InvalidEntry(String),

    /// HTTP request failed or returned a non-success status
    #[error("HTTP error: {0}")]
    Http(String),

    /// Filesystem watch could not be established
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Sync command launcher misconfiguration
    #[error("Sync command error: {0}")]
    SyncCommand(String),
}

impl WatcherError {
    /// Create an invalid-path error
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create an invalid-filter error
    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }
}

/// Result type alias for watcher operations
pub type WatcherResult<T> = Result<T, WatcherError>;
