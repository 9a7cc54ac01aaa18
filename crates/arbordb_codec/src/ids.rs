//! The wire form of record references.

use crate::error::{CodecError, CodecResult};
use std::fmt;

/// Size in bytes of an encoded record reference.
pub const RECORD_REF_BYTES: usize = 6;

/// A record reference as it appears inside a segment: an index into the
/// enclosing segment's reference table plus a record number.
///
/// Index 0 denotes the enclosing segment itself; indices `1..=refs` index
/// the reference table. The reference is resolved to a full segment
/// identity by whoever owns the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef {
    segment_index: u16,
    number: u32,
}

impl RecordRef {
    /// Creates a reference from a table index and a record number.
    #[must_use]
    pub const fn new(segment_index: u16, number: u32) -> Self {
        Self {
            segment_index,
            number,
        }
    }

    /// Returns the reference-table index of the referent segment.
    #[must_use]
    pub const fn segment_index(self) -> u16 {
        self.segment_index
    }

    /// Returns the record number within the referent segment.
    #[must_use]
    pub const fn number(self) -> u32 {
        self.number
    }

    /// Encodes the reference into its 6-byte wire form.
    #[must_use]
    pub fn encode(self) -> [u8; RECORD_REF_BYTES] {
        let mut buf = [0u8; RECORD_REF_BYTES];
        buf[..2].copy_from_slice(&self.segment_index.to_be_bytes());
        buf[2..].copy_from_slice(&self.number.to_be_bytes());
        buf
    }

    /// Decodes a reference from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BadRecord`] if fewer than 6 bytes are given.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let raw: &[u8; RECORD_REF_BYTES] = bytes
            .get(..RECORD_REF_BYTES)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CodecError::bad_record("truncated record reference"))?;
        let segment_index = u16::from_be_bytes([raw[0], raw[1]]);
        let number = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
        Ok(Self {
            segment_index,
            number,
        })
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.segment_index, self.number)
    }
}
