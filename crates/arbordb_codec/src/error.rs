//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The first byte of a length field matches no known encoding.
    #[error("invalid length marker: {marker:#04x}")]
    InvalidLengthMarker {
        /// The offending marker byte.
        marker: u8,
    },

    /// The first byte of a blob identifier matches no known encoding.
    #[error("invalid blob id marker: {marker:#04x}")]
    InvalidBlobMarker {
        /// The offending marker byte.
        marker: u8,
    },

    /// A value exceeds the maximum supported length.
    #[error("value too long: {length} bytes")]
    ValueTooLong {
        /// The requested length.
        length: u64,
    },

    /// An access did not stay within a record's declared extent.
    #[error("bad record: {message}")]
    BadRecord {
        /// Description of the violation.
        message: String,
    },

    /// A string record did not contain valid UTF-8.
    #[error("invalid UTF-8 in string record")]
    InvalidUtf8,

    /// A template record violated its declared structure.
    #[error("invalid template: {message}")]
    InvalidTemplate {
        /// Description of the violation.
        message: String,
    },
}

impl CodecError {
    /// Creates a bad record error.
    pub fn bad_record(message: impl Into<String>) -> Self {
        Self::BadRecord {
            message: message.into(),
        }
    }

    /// Creates an invalid template error.
    pub fn invalid_template(message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            message: message.into(),
        }
    }
}
