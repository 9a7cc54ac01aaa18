//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a segment backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backend directory is locked by another process.
    #[error("storage locked: another process holds {path}")]
    Locked {
        /// Path of the lock file.
        path: PathBuf,
    },

    /// A file in the backend directory does not look like a segment.
    #[error("not a segment file: {name}")]
    InvalidSegmentFile {
        /// The offending file name.
        name: String,
    },
}
