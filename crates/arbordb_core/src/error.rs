//! Error types for the segment engine.

use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the segment engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Record-level encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] arbordb_codec::CodecError),

    /// Persistence backend error.
    #[error("storage error: {0}")]
    Storage(#[from] arbordb_storage::StorageError),

    /// The store has no segment for the given id.
    ///
    /// Carries the diagnostic composed from the id's age, reclamation note
    /// and generation. Never retried internally.
    #[error("segment not found: {id} [{gc_info}]")]
    SegmentNotFound {
        /// The missing segment id in UUID form.
        id: String,
        /// Age, reclamation note and generation of the id.
        gc_info: String,
    },

    /// A record or segment violated its declared structure.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Description of the violation.
        message: String,
    },

    /// A cache loader failed.
    #[error("segment load failed: {source}")]
    LoadFailure {
        /// The underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// A record does not fit even an empty segment.
    #[error("record too large: {size} bytes exceed the segment limit of {limit}")]
    RecordTooLarge {
        /// Requested record size including its reference slots.
        size: usize,
        /// Maximum payload a segment of the configured size can hold.
        limit: usize,
    },

    /// The writer pool's internal tables became inconsistent.
    #[error("writer pool inconsistency: {message}")]
    PoolViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a pool violation error.
    pub fn pool_violation(message: impl Into<String>) -> Self {
        Self::PoolViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Wraps a loader failure.
    #[must_use]
    pub fn load_failure(source: CoreError) -> Self {
        Self::LoadFailure {
            source: Box::new(source),
        }
    }
}
