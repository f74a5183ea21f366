//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, MapDbError>;

/// All errors surfaced by the map database.
#[derive(Debug, Error)]
pub enum MapDbError {
    /// The backing file (or base directory) does not exist and creation was
    /// not requested.
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// A key path segment was not present in the document.
    #[error("key '{key}' not found at path '{path}'")]
    KeyNotFound { key: String, path: String },

    /// Path traversal hit a node that is not a mapping.
    #[error("path '{path}' is not a map")]
    PathNotMap { path: String },

    /// A key path contained an empty segment where one is not allowed.
    #[error("empty key segment at path '{path}'")]
    EmptySegment { path: String },

    /// Read or write was attempted at the document root via a key path.
    #[error("the document root is not addressable by key path")]
    RootNotAddressable,

    /// Optimistic concurrency control detected that the file changed since
    /// this store last read or wrote it.
    #[error("concurrent modification detected for file {}", path.display())]
    FileConflict { path: PathBuf },

    /// A key or value codec failed while encoding or decoding.
    #[error("codec failure at path '{path}': {reason}")]
    CodecFailure { path: String, reason: String },

    /// A continuation token could not be decoded or carried an invalid
    /// envelope.
    #[error("invalid page token: {reason}")]
    InvalidPageToken { reason: String },

    /// Invalid caller-supplied configuration (duplicate column, empty table
    /// name, unknown column reference, bad file key, ...).
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A lower-level I/O failure, wrapped with enough context to locate it.
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl MapDbError {
    /// Wrap an I/O error with a contextual prefix.
    pub(crate) fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        MapDbError::Storage {
            context: context.into(),
            source,
        }
    }

    /// True when the error is an OCC conflict, the only class of error that
    /// is ever retried internally.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, MapDbError::FileConflict { .. })
    }
}
