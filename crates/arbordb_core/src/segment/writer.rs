//! Append-only construction of a single segment.

use crate::error::{CoreError, CoreResult};
use crate::segment::id::{RecordId, SegmentId};
use crate::segment::{
    FORMAT_VERSION, HEADER_BYTES, MAGIC, RECORD_ENTRY_BYTES, REF_ENTRY_BYTES,
};
use crate::store::SegmentStore;
use crate::types::{Generation, RecordType};
use arbordb_codec::{RecordRef, RECORD_REF_BYTES};
use std::collections::HashMap;
use std::sync::Arc;

/// Largest number of entries the reference table can hold; index 0 is the
/// segment itself and is never stored.
const MAX_REFS: usize = u16::MAX as usize;

/// One record being accumulated in the buffer.
#[derive(Debug)]
struct BufferedRecord {
    number: u32,
    ty: RecordType,
    /// Reserved size: the payload size plus the record-id slots.
    size: usize,
    data: Vec<u8>,
}

/// Accumulates records into an in-memory segment and emits it on flush.
///
/// A buffer writer owns the identity of the segment it is building, so
/// [`prepare`](Self::prepare) can hand out stable [`RecordId`]s before the
/// segment is durable. When the next record would overflow the configured
/// maximum segment size, the current buffer is flushed and a fresh segment
/// is started.
///
/// Writers are single-writer by contract: a writer is never used by two
/// threads at the same time (the pool enforces thread affinity) and is not
/// internally synchronized.
pub struct SegmentBufferWriter {
    store: Arc<dyn SegmentStore>,
    writer_id: String,
    generation: Generation,
    max_segment_size: usize,
    token: u64,
    segment_id: Arc<SegmentId>,
    /// Set after a flush; the next prepare mints the next segment's id.
    flushed: bool,
    refs: Vec<Arc<SegmentId>>,
    ref_index: HashMap<(u64, u64), u16>,
    records: Vec<BufferedRecord>,
    payload_bytes: usize,
    next_number: u32,
}

impl SegmentBufferWriter {
    /// Creates a writer building segments of at most `max_segment_size`
    /// bytes for the given store.
    pub fn new(
        store: Arc<dyn SegmentStore>,
        writer_id: String,
        generation: Generation,
        max_segment_size: usize,
        token: u64,
    ) -> Self {
        let segment_id = store.tracker().new_data_segment_id();
        Self {
            store,
            writer_id,
            generation,
            max_segment_size,
            token,
            segment_id,
            flushed: false,
            refs: Vec::new(),
            ref_index: HashMap::new(),
            records: Vec::new(),
            payload_bytes: 0,
            next_number: 0,
        }
    }

    /// Returns the writer id, e.g. `w.0007`.
    #[must_use]
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Returns the generation this writer stamps on its segments.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns the id of the segment currently being built.
    #[must_use]
    pub fn segment_id(&self) -> &Arc<SegmentId> {
        &self.segment_id
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Size the serialized segment would have with the current buffer
    /// contents plus one record of `record_size` bytes adding `new_refs`
    /// reference-table entries.
    fn projected_size(&self, new_refs: usize, record_size: usize) -> usize {
        HEADER_BYTES
            + (self.refs.len() + new_refs) * REF_ENTRY_BYTES
            + (self.records.len() + 1) * RECORD_ENTRY_BYTES
            + self.payload_bytes
            + record_size
    }

    /// Counts how many of `ids` would be new reference-table entries.
    fn count_new_refs(&self, ids: &[RecordId]) -> usize {
        let mut seen = Vec::new();
        for id in ids {
            let key = (id.segment_id().msb(), id.segment_id().lsb());
            if key == (self.segment_id.msb(), self.segment_id.lsb()) {
                continue;
            }
            if self.ref_index.contains_key(&key) || seen.contains(&key) {
                continue;
            }
            seen.push(key);
        }
        seen.len()
    }

    /// Reserves `size` payload bytes plus one record-id slot per entry of
    /// `refs`, and returns the id of the new record.
    ///
    /// Record numbers are handed out monotonically from 0 within each
    /// segment. If the record would overflow the segment or its reference
    /// table, the current buffer is flushed first and the record starts a
    /// fresh segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordTooLarge`] if the record cannot fit even
    /// an empty segment.
    pub fn prepare(
        &mut self,
        ty: RecordType,
        size: usize,
        refs: &[RecordId],
    ) -> CoreResult<RecordId> {
        self.ensure_fresh_segment();
        let record_size = size + refs.len() * RECORD_REF_BYTES;

        let new_refs = self.count_new_refs(refs);
        if self.projected_size(new_refs, record_size) > self.max_segment_size
            || self.refs.len() + new_refs > MAX_REFS
        {
            self.flush()?;
            self.ensure_fresh_segment();
            // All references are new against the empty table; references
            // to records of the just-flushed segment now cross segments.
            let new_refs = refs.len().min(MAX_REFS);
            if self.projected_size(new_refs, record_size) > self.max_segment_size {
                return Err(CoreError::RecordTooLarge {
                    size: record_size,
                    limit: self.max_segment_size.saturating_sub(
                        HEADER_BYTES + RECORD_ENTRY_BYTES + new_refs * REF_ENTRY_BYTES,
                    ),
                });
            }
        }

        self.close_current();
        let number = self.next_number;
        self.next_number += 1;
        self.records.push(BufferedRecord {
            number,
            ty,
            size: record_size,
            data: Vec::with_capacity(record_size),
        });
        self.payload_bytes += record_size;
        Ok(RecordId::new(Arc::clone(&self.segment_id), number))
    }

    /// Mints the next segment's id if the previous buffer was flushed.
    fn ensure_fresh_segment(&mut self) {
        if self.flushed {
            self.segment_id = self.store.tracker().new_data_segment_id();
            self.flushed = false;
        }
    }

    /// Pads the record being written out to its reservation.
    fn close_current(&mut self) {
        if let Some(record) = self.records.last_mut() {
            record.data.resize(record.size, 0);
        }
    }

    /// Appends bytes to the current record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no record is prepared or
    /// the write exceeds the record's reservation.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let record = self
            .records
            .last_mut()
            .ok_or_else(|| CoreError::invalid_operation("no record prepared"))?;
        if record.data.len() + bytes.len() > record.size {
            return Err(CoreError::invalid_operation(format!(
                "write of {} bytes exceeds the {}-byte reservation of record {}",
                bytes.len(),
                record.size,
                record.number
            )));
        }
        record.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends one byte to the current record.
    pub fn write_u8(&mut self, value: u8) -> CoreResult<()> {
        self.write_bytes(&[value])
    }

    /// Appends a big-endian `u16` to the current record.
    pub fn write_u16(&mut self, value: u16) -> CoreResult<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `u32` to the current record.
    pub fn write_u32(&mut self, value: u32) -> CoreResult<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `u64` to the current record.
    pub fn write_u64(&mut self, value: u64) -> CoreResult<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Appends the 6-byte wire form of a record id to the current record,
    /// interning the referent segment in the reference table.
    ///
    /// References are deduplicated by segment identity; the segment being
    /// built is index 0.
    pub fn write_record_id(&mut self, id: &RecordId) -> CoreResult<()> {
        let index = self.reference_index(id.segment_id())?;
        let wire = RecordRef::new(index, id.number()).encode();
        self.write_bytes(&wire)
    }

    fn reference_index(&mut self, id: &Arc<SegmentId>) -> CoreResult<u16> {
        let key = (id.msb(), id.lsb());
        if key == (self.segment_id.msb(), self.segment_id.lsb()) {
            return Ok(0);
        }
        if let Some(index) = self.ref_index.get(&key) {
            return Ok(*index);
        }
        if self.refs.len() >= MAX_REFS {
            return Err(CoreError::invalid_operation(
                "segment reference table overflow",
            ));
        }
        self.refs.push(Arc::clone(id));
        let index = self.refs.len() as u16;
        self.ref_index.insert(key, index);
        Ok(index)
    }

    /// Emits the accumulated segment to the store and recycles the buffer
    /// under a fresh segment id. Flushing an empty buffer writes nothing.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the buffer is left untouched so the
    /// flush can be retried.
    pub fn flush(&mut self) -> CoreResult<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.close_current();

        let data = self.serialize();
        self.store
            .write_segment(&self.segment_id, &data, 0, data.len())?;

        self.flushed = true;
        self.refs.clear();
        self.ref_index.clear();
        self.records.clear();
        self.payload_bytes = 0;
        self.next_number = 0;
        Ok(())
    }

    fn serialize(&self) -> Vec<u8> {
        let size = HEADER_BYTES
            + self.refs.len() * REF_ENTRY_BYTES
            + self.records.len() * RECORD_ENTRY_BYTES
            + self.payload_bytes;
        let mut data = Vec::with_capacity(size);

        data.extend_from_slice(&MAGIC);
        data.push(FORMAT_VERSION);
        data.push(0);
        data.extend_from_slice(&self.generation.as_u32().to_be_bytes());
        data.extend_from_slice(&(self.refs.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.records.len() as u16).to_be_bytes());

        for id in &self.refs {
            data.extend_from_slice(&id.msb().to_be_bytes());
            data.extend_from_slice(&id.lsb().to_be_bytes());
        }

        let mut offset = 0u32;
        for record in &self.records {
            offset += record.size as u32;
            data.extend_from_slice(&record.number.to_be_bytes());
            data.push(record.ty.as_u8());
            data.extend_from_slice(&offset.to_be_bytes());
        }

        // Records are packed at the segment end in allocation order, the
        // first record nearest the end.
        for record in self.records.iter().rev() {
            data.extend_from_slice(&record.data);
        }

        data
    }
}

impl std::fmt::Debug for SegmentBufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBufferWriter")
            .field("writer_id", &self.writer_id)
            .field("generation", &self.generation)
            .field("segment_id", &self.segment_id.to_string())
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn writer_with_limit(limit: usize) -> (Arc<Store>, SegmentBufferWriter) {
        let store = Arc::new(Store::memory());
        let writer = SegmentBufferWriter::new(
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            "w.0000".to_string(),
            Generation::new(1),
            limit,
            0,
        );
        (store, writer)
    }

    fn writer() -> (Arc<Store>, SegmentBufferWriter) {
        writer_with_limit(256 * 1024)
    }

    #[test]
    fn record_numbers_are_monotonic_from_zero() {
        let (_store, mut w) = writer();
        for expected in 0..5 {
            let id = w.prepare(RecordType::Block, 1, &[]).unwrap();
            w.write_u8(0xAB).unwrap();
            assert_eq!(id.number(), expected);
            assert!(Arc::ptr_eq(id.segment_id(), w.segment_id()));
        }
    }

    #[test]
    fn flush_makes_records_readable() {
        let (store, mut w) = writer();
        let id = w.prepare(RecordType::Block, 4, &[]).unwrap();
        w.write_u32(0xCAFE_BABE).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u32(id.number(), 0).unwrap(), 0xCAFE_BABE);
        assert_eq!(segment.generation(), Some(Generation::new(1)));
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let (store, mut w) = writer();
        let before = w.segment_id().to_string();
        w.flush().unwrap();
        assert_eq!(w.segment_id().to_string(), before);
        assert!(!store.contains_segment(w.segment_id()));
    }

    #[test]
    fn underfilled_records_are_zero_padded() {
        let (store, mut w) = writer();
        let id = w.prepare(RecordType::Block, 4, &[]).unwrap();
        w.write_u8(0xFF).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_bytes(id.number(), 0, 4).unwrap(), &[0xFF, 0, 0, 0]);
    }

    #[test]
    fn write_past_reservation_fails() {
        let (_store, mut w) = writer();
        w.prepare(RecordType::Block, 2, &[]).unwrap();
        w.write_u8(1).unwrap();
        assert!(w.write_u32(2).is_err());
    }

    #[test]
    fn writes_without_prepare_fail() {
        let (_store, mut w) = writer();
        assert!(matches!(
            w.write_u8(0),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn references_are_deduplicated_by_identity() {
        let (store, mut w) = writer();
        let other = store.tracker().new_data_segment_id();
        let a = RecordId::new(Arc::clone(&other), 1);
        let b = RecordId::new(Arc::clone(&other), 2);

        let id = w
            .prepare(RecordType::Bucket, 0, &[a.clone(), b.clone()])
            .unwrap();
        w.write_record_id(&a).unwrap();
        w.write_record_id(&b).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.ref_count(), 1);
        assert_eq!(segment.read_record_id(id.number(), 0).unwrap(), a);
        assert_eq!(
            segment.read_record_id(id.number(), RECORD_REF_BYTES).unwrap(),
            b
        );
        // Wire form: reference-table index 1, then the record number.
        assert_eq!(
            segment.read_bytes(id.number(), 0, 6).unwrap(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn own_segment_is_reference_index_zero() {
        let (store, mut w) = writer();
        let first = w.prepare(RecordType::Block, 1, &[]).unwrap();
        w.write_u8(7).unwrap();

        let second = w.prepare(RecordType::Node, 0, &[first.clone()]).unwrap();
        w.write_record_id(&first).unwrap();
        w.flush().unwrap();

        let segment = store.segment(second.segment_id()).unwrap();
        assert_eq!(segment.ref_count(), 0);
        assert_eq!(segment.read_record_id(second.number(), 0).unwrap(), first);
    }

    #[test]
    fn overflow_starts_a_new_segment() {
        let (store, mut w) = writer_with_limit(128);
        let first = w.prepare(RecordType::Block, 60, &[]).unwrap();
        w.write_bytes(&[1u8; 60]).unwrap();

        // 16 header + 2 * 9 records + 120 payload > 128, so this flushes.
        let second = w.prepare(RecordType::Block, 60, &[]).unwrap();
        w.write_bytes(&[2u8; 60]).unwrap();
        w.flush().unwrap();

        assert!(!Arc::ptr_eq(first.segment_id(), second.segment_id()));
        assert_eq!(second.number(), 0);

        let s1 = store.segment(first.segment_id()).unwrap();
        assert_eq!(s1.read_bytes(first.number(), 0, 60).unwrap(), &[1u8; 60][..]);
        let s2 = store.segment(second.segment_id()).unwrap();
        assert_eq!(s2.read_bytes(second.number(), 0, 60).unwrap(), &[2u8; 60][..]);
    }

    #[test]
    fn record_too_large_is_rejected() {
        let (_store, mut w) = writer_with_limit(64);
        let result = w.prepare(RecordType::Block, 1024, &[]);
        assert!(matches!(result, Err(CoreError::RecordTooLarge { .. })));
    }
}
