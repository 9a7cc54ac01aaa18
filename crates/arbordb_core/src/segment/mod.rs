//! Segments and their in-memory representation.
//!
//! A segment is a fixed-size, immutable byte container and the atomic unit
//! of I/O. Data segments carry a structured header and may reference other
//! segments; bulk segments are opaque bytes.
//!
//! ## Data segment layout (format version 1)
//!
//! ```text
//! | magic+version (8) | generation (4) | ref count (2) | record count (2) |
//! | reference table (16 x refs) | record table (9 x records) | payload |
//! ```
//!
//! Reference-table entries are `(msb, lsb)` pairs; record-table entries are
//! `(u32 number, u8 type, u32 offset)` where the offset is measured from
//! the segment end. Records are packed at the end of the segment in
//! allocation order, the first record nearest the end, so a record's extent
//! runs from its own start to the start of the previously allocated record.
//! All integers are big-endian.

mod cache;
mod id;
mod pool;
pub mod records;
mod writer;

pub use cache::{CacheStats, SegmentCache};
pub use id::{RecordId, SegmentId, SegmentTracker};
pub use pool::{GenerationSupplier, SegmentBufferWriterPool};
pub use writer::SegmentBufferWriter;

use crate::error::{CoreError, CoreResult};
use crate::types::{Generation, RecordType};
use arbordb_codec::{CodecError, CodecResult, RecordReader, RecordRef, StringValue, Template};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Magic bytes opening every data segment.
pub(crate) const MAGIC: [u8; 6] = *b"arbseg";

/// Current segment format version.
pub(crate) const FORMAT_VERSION: u8 = 1;

/// Size of the fixed data segment header.
pub(crate) const HEADER_BYTES: usize = 16;

/// Size of one reference table entry.
pub(crate) const REF_ENTRY_BYTES: usize = 16;

/// Size of one record table entry.
pub(crate) const RECORD_ENTRY_BYTES: usize = 9;

/// One entry of the record table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordEntry {
    pub(crate) number: u32,
    pub(crate) ty: RecordType,
    /// Distance from the start of the record to the segment end.
    pub(crate) offset: u32,
}

#[derive(Debug)]
struct ParsedHeader {
    generation: Generation,
    refs: Vec<Arc<SegmentId>>,
    records: Vec<RecordEntry>,
    tables_end: usize,
}

/// A loaded segment.
///
/// Shared between the 2nd-level cache and the 1st-level reference on its
/// [`SegmentId`]; it lives as long as the longer of the two holders.
#[derive(Debug)]
pub struct Segment {
    id: Arc<SegmentId>,
    data: Vec<u8>,
    header: Option<ParsedHeader>,
    accessed: AtomicBool,
}

impl Segment {
    /// Parses a segment from its stored bytes.
    ///
    /// Data segments have their header and tables validated and their
    /// reference table resolved through `tracker`; bulk segments are taken
    /// as-is.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if the bytes do not form a
    /// valid segment of the id's type.
    pub fn parse(
        id: Arc<SegmentId>,
        data: Vec<u8>,
        tracker: &SegmentTracker,
    ) -> CoreResult<Self> {
        let header = if id.is_bulk() {
            None
        } else if id.is_data() {
            Some(Self::parse_header(&data, tracker)?)
        } else {
            return Err(CoreError::invalid_record(format!(
                "segment {id} has an unknown type nibble"
            )));
        };
        Ok(Self {
            id,
            data,
            header,
            accessed: AtomicBool::new(false),
        })
    }

    fn parse_header(data: &[u8], tracker: &SegmentTracker) -> CoreResult<ParsedHeader> {
        if data.len() < HEADER_BYTES {
            return Err(CoreError::invalid_record("segment shorter than its header"));
        }
        if data[..6] != MAGIC {
            return Err(CoreError::invalid_record("bad segment magic"));
        }
        if data[6] != FORMAT_VERSION {
            return Err(CoreError::invalid_record(format!(
                "unsupported segment format version {}",
                data[6]
            )));
        }

        let generation = Generation::new(u32::from_be_bytes([
            data[8], data[9], data[10], data[11],
        ]));
        let ref_count = usize::from(u16::from_be_bytes([data[12], data[13]]));
        let record_count = usize::from(u16::from_be_bytes([data[14], data[15]]));

        let tables_end =
            HEADER_BYTES + ref_count * REF_ENTRY_BYTES + record_count * RECORD_ENTRY_BYTES;
        if data.len() < tables_end {
            return Err(CoreError::invalid_record("segment tables are truncated"));
        }

        let read_u64 = |pos: usize| -> u64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[pos..pos + 8]);
            u64::from_be_bytes(raw)
        };
        let read_u32 = |pos: usize| -> u32 {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[pos..pos + 4]);
            u32::from_be_bytes(raw)
        };

        let mut refs = Vec::with_capacity(ref_count);
        let mut pos = HEADER_BYTES;
        for _ in 0..ref_count {
            refs.push(tracker.intern(read_u64(pos), read_u64(pos + 8)));
            pos += REF_ENTRY_BYTES;
        }

        let mut records: Vec<RecordEntry> = Vec::with_capacity(record_count);
        let payload = data.len() - tables_end;
        for _ in 0..record_count {
            let number = read_u32(pos);
            let ty = RecordType::from_u8(data[pos + 4]).ok_or_else(|| {
                CoreError::invalid_record(format!("unknown record type {}", data[pos + 4]))
            })?;
            let offset = read_u32(pos + 5);
            if offset as usize > payload {
                return Err(CoreError::invalid_record(
                    "record offset points into the segment tables",
                ));
            }
            if let Some(prev) = records.last() {
                if number <= prev.number || offset <= prev.offset {
                    return Err(CoreError::invalid_record(
                        "record table is not in allocation order",
                    ));
                }
            }
            records.push(RecordEntry { number, ty, offset });
            pos += RECORD_ENTRY_BYTES;
        }

        Ok(ParsedHeader {
            generation,
            refs,
            records,
            tables_end,
        })
    }

    /// Returns the id of this segment.
    #[must_use]
    pub fn id(&self) -> &Arc<SegmentId> {
        &self.id
    }

    /// Returns the size of this segment in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the raw bytes of this segment.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Marks this segment as recently accessed.
    pub fn access(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    /// Clears and returns the access mark. Used by the cache's eviction
    /// loop to give recently used segments a second chance.
    pub(crate) fn take_accessed(&self) -> bool {
        self.accessed.swap(false, Ordering::Relaxed)
    }

    /// Returns the generation this segment was written in, or `None` for a
    /// bulk segment.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        self.header.as_ref().map(|h| h.generation)
    }

    /// Returns the number of entries in the reference table.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.header.as_ref().map_or(0, |h| h.refs.len())
    }

    /// Returns the number of records in this segment.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.header.as_ref().map_or(0, |h| h.records.len())
    }

    /// Returns the numbers and types of all records, in allocation order.
    #[must_use]
    pub fn records(&self) -> Vec<(u32, RecordType)> {
        self.header
            .as_ref()
            .map_or_else(Vec::new, |h| {
                h.records.iter().map(|r| (r.number, r.ty)).collect()
            })
    }

    /// Returns the type of record `number`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if the record does not exist.
    pub fn record_type(&self, number: u32) -> CoreResult<RecordType> {
        let (entry, _) = self.entry(number).map_err(CoreError::from)?;
        Ok(entry.ty)
    }

    /// Resolves an index of this segment's reference table.
    ///
    /// Index 0 is the segment itself; indices `1..=refs` are the table
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] for an index past the table.
    pub fn ref_id(&self, index: u16) -> CoreResult<&Arc<SegmentId>> {
        if index == 0 {
            return Ok(&self.id);
        }
        let refs = self.header.as_ref().map(|h| &h.refs).ok_or_else(|| {
            CoreError::invalid_record("bulk segments have no reference table")
        })?;
        refs.get(usize::from(index) - 1).ok_or_else(|| {
            CoreError::invalid_record(format!(
                "reference index {index} past the table of {} entries",
                refs.len()
            ))
        })
    }

    /// Resolves a wire-level record reference to a full record id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] for an unknown reference index.
    pub fn resolve_ref(&self, r: RecordRef) -> CoreResult<RecordId> {
        let id = self.ref_id(r.segment_index())?;
        Ok(RecordId::new(Arc::clone(id), r.number()))
    }

    /// Looks up a record entry and its index in the record table.
    fn entry(&self, number: u32) -> CodecResult<(&RecordEntry, usize)> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| CodecError::bad_record("bulk segments have no records"))?;
        let idx = header
            .records
            .binary_search_by_key(&number, |r| r.number)
            .map_err(|_| CodecError::bad_record(format!("no record {number}")))?;
        Ok((&header.records[idx], idx))
    }

    /// Reads one byte of record `number` at `offset`.
    pub fn read_u8(&self, number: u32, offset: usize) -> CoreResult<u8> {
        Ok(RecordReader::read_u8(self, number, offset)?)
    }

    /// Reads a big-endian `u16` of record `number` at `offset`.
    pub fn read_u16(&self, number: u32, offset: usize) -> CoreResult<u16> {
        Ok(RecordReader::read_u16(self, number, offset)?)
    }

    /// Reads a big-endian `u32` of record `number` at `offset`.
    pub fn read_u32(&self, number: u32, offset: usize) -> CoreResult<u32> {
        Ok(RecordReader::read_u32(self, number, offset)?)
    }

    /// Reads a big-endian `u64` of record `number` at `offset`.
    pub fn read_u64(&self, number: u32, offset: usize) -> CoreResult<u64> {
        Ok(RecordReader::read_u64(self, number, offset)?)
    }

    /// Borrows `len` bytes of record `number` starting at `position`.
    pub fn read_bytes(&self, number: u32, position: usize, len: usize) -> CoreResult<&[u8]> {
        Ok(RecordReader::bytes(self, number, position, len)?)
    }

    /// Reads the length field at the start of record `number`.
    pub fn read_length(&self, number: u32) -> CoreResult<u64> {
        Ok(RecordReader::read_length(self, number)?)
    }

    /// Reads the string value starting at record `number`. Long strings
    /// decode to a reference; [`crate::Store::read_string`] follows it.
    pub fn read_string(&self, number: u32) -> CoreResult<StringValue> {
        Ok(RecordReader::read_string(self, number)?)
    }

    /// Reads the blob identifier starting at record `number`.
    pub fn read_blob_ref(&self, number: u32) -> CoreResult<arbordb_codec::BlobRef> {
        Ok(RecordReader::read_blob_ref(self, number)?)
    }

    /// Reads the template record `number`.
    pub fn read_template(&self, number: u32) -> CoreResult<Template> {
        Ok(RecordReader::read_template(self, number)?)
    }

    /// Reads the record id at `offset` of record `number`, resolving the
    /// reference table.
    pub fn read_record_id(&self, number: u32, offset: usize) -> CoreResult<RecordId> {
        let r = RecordReader::read_record_ref(self, number, offset)?;
        self.resolve_ref(r)
    }
}

impl RecordReader for Segment {
    fn bytes(&self, number: u32, offset: usize, len: usize) -> CodecResult<&[u8]> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| CodecError::bad_record("bulk segments have no records"))?;
        let idx = header
            .records
            .binary_search_by_key(&number, |r| r.number)
            .map_err(|_| CodecError::bad_record(format!("no record {number}")))?;
        let entry = &header.records[idx];

        let end_of_segment = self.data.len();
        let start = end_of_segment - entry.offset as usize;
        let limit = match idx {
            0 => end_of_segment,
            _ => end_of_segment - header.records[idx - 1].offset as usize,
        };

        let from = start + offset;
        let to = from + len;
        if to > limit {
            return Err(CodecError::bad_record(format!(
                "read of {len} bytes at offset {offset} crosses the boundary of record {number}"
            )));
        }
        Ok(&self.data[from..to])
    }
}
