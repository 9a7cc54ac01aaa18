//! Typed reads over record payloads.

use crate::blob::{self, BlobIdForm};
use crate::error::{CodecError, CodecResult};
use crate::ids::{RecordRef, RECORD_REF_BYTES};
use crate::length::{self, MAX_VALUE_LENGTH, MEDIUM_LIMIT, SMALL_LIMIT};
use crate::template::{unpack_header, Children, Template};
use crate::value::{BlobRef, StringValue};

/// Typed reads over the records of a segment.
///
/// Implementors supply [`bytes`](RecordReader::bytes), a bounds-checked
/// view into a record's payload; every read must stay within the record's
/// declared extent, and a violation is a bad-record fault. The provided
/// methods decode the record-level encodings on top of it.
pub trait RecordReader {
    /// Borrows `len` bytes of record `number` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BadRecord`] if the record does not exist or
    /// the range crosses its boundary.
    fn bytes(&self, number: u32, offset: usize, len: usize) -> CodecResult<&[u8]>;

    /// Reads one byte of record `number` at `offset`.
    fn read_u8(&self, number: u32, offset: usize) -> CodecResult<u8> {
        Ok(self.bytes(number, offset, 1)?[0])
    }

    /// Reads a big-endian `u16` of record `number` at `offset`.
    fn read_u16(&self, number: u32, offset: usize) -> CodecResult<u16> {
        let b = self.bytes(number, offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian `u32` of record `number` at `offset`.
    fn read_u32(&self, number: u32, offset: usize) -> CodecResult<u32> {
        let b = self.bytes(number, offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `u64` of record `number` at `offset`.
    fn read_u64(&self, number: u32, offset: usize) -> CodecResult<u64> {
        let b = self.bytes(number, offset, 8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads a 6-byte record reference of record `number` at `offset`.
    fn read_record_ref(&self, number: u32, offset: usize) -> CodecResult<RecordRef> {
        RecordRef::decode(self.bytes(number, offset, RECORD_REF_BYTES)?)
    }

    /// Reads the length field at the start of record `number`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidLengthMarker`] if the first byte
    /// matches no length form.
    fn read_length(&self, number: u32) -> CodecResult<u64> {
        let marker = self.read_u8(number, 0)?;
        let size = length::marker_size(marker)?;
        let (value, _) = length::decode(self.bytes(number, 0, size)?)?;
        Ok(value)
    }

    /// Reads the string value starting at record `number`.
    ///
    /// Small and medium strings decode in place; a long string decodes to
    /// a reference to its out-of-line payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ValueTooLong`] for lengths the string model
    /// does not support, and [`CodecError::InvalidUtf8`] for byte content
    /// that is not UTF-8.
    fn read_string(&self, number: u32) -> CodecResult<StringValue> {
        let len = self.read_length(number)?;
        if len < SMALL_LIMIT {
            let bytes = self.bytes(number, 1, len as usize)?;
            decode_utf8(bytes).map(StringValue::Inline)
        } else if len < MEDIUM_LIMIT {
            let bytes = self.bytes(number, 2, len as usize)?;
            decode_utf8(bytes).map(StringValue::Inline)
        } else if len < MAX_VALUE_LENGTH {
            let id = self.read_record_ref(number, 8)?;
            Ok(StringValue::External { id, length: len })
        } else {
            Err(CodecError::ValueTooLong { length: len })
        }
    }

    /// Reads the blob identifier starting at record `number`.
    fn read_blob_ref(&self, number: u32) -> CodecResult<BlobRef> {
        let marker = self.read_u8(number, 0)?;
        if marker == blob::LONG_BLOB_ID_MARKER {
            let id = self.read_record_ref(number, 1)?;
            return Ok(BlobRef::External(id));
        }
        let header = self.bytes(number, 0, blob::SMALL_BLOB_ID_HEADER_BYTES)?;
        match blob::classify(header)? {
            BlobIdForm::Small(len) => {
                let bytes = self.bytes(number, blob::SMALL_BLOB_ID_HEADER_BYTES, len)?;
                Ok(BlobRef::Inline(bytes.to_vec()))
            }
            BlobIdForm::Long => Err(CodecError::bad_record("ambiguous blob id marker")),
        }
    }

    /// Reads the template record `number`.
    ///
    /// The header determines which fields follow; they are consumed in the
    /// fixed order primary type, mixins, sole-child name, property names
    /// and property-type bytes.
    fn read_template(&self, number: u32) -> CodecResult<Template> {
        let header = unpack_header(self.read_u32(number, 0)?);
        let mut offset = 4;
        let mut builder = Template::builder();

        if header.has_primary {
            builder = builder.primary_type(self.read_record_ref(number, offset)?);
            offset += RECORD_REF_BYTES;
        }

        if header.has_mixins {
            let mut mixins = Vec::with_capacity(header.mixin_count);
            for _ in 0..header.mixin_count {
                mixins.push(self.read_record_ref(number, offset)?);
                offset += RECORD_REF_BYTES;
            }
            builder = builder.mixins(mixins);
        }

        builder = if header.no_children {
            builder.children(Children::None)
        } else if header.many_children {
            builder.children(Children::Many)
        } else {
            let name = self.read_record_ref(number, offset)?;
            offset += RECORD_REF_BYTES;
            builder.children(Children::One(name))
        };

        if header.property_count > 0 {
            let names = self.read_record_ref(number, offset)?;
            offset += RECORD_REF_BYTES;
            let types = self
                .bytes(number, offset, header.property_count)?
                .to_vec();
            builder = builder.properties(names, types);
        }

        builder.build()
    }
}

fn decode_utf8(bytes: &[u8]) -> CodecResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}
