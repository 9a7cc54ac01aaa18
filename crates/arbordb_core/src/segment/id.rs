//! Segment identity, interning and record identifiers.

use crate::segment::Segment;
use crate::types::Generation;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Value of the type nibble marking a data segment.
const DATA_NIBBLE: u64 = 0xA;

/// Value of the type nibble marking a bulk segment.
const BULK_NIBBLE: u64 = 0xB;

/// Sentinel stored while the generation of a segment id is unknown.
const GENERATION_UNKNOWN: i64 = -1;

/// Segment identifier.
///
/// There are two types of segments: data segments, and bulk segments.
/// Data segments have a header and may reference other segments; bulk
/// segments do not. The type is encoded in the top nibble of the low half
/// of the identifier.
///
/// Besides its 128 bits, an id carries in-memory state: its creation time,
/// the generation tag of its segment (filled on first load), a reclamation
/// note set when the garbage collector reclaims the segment, and a
/// reference to the loaded segment. The reference is the 1st-level cache:
/// set on load, cleared on eviction, possibly repopulated by a later load.
pub struct SegmentId {
    msb: u64,
    lsb: u64,
    created_at: Instant,
    generation: AtomicI64,
    reclamation: Mutex<Option<String>>,
    segment: RwLock<Option<Arc<Segment>>>,
    load_lock: Mutex<()>,
}

impl SegmentId {
    pub(crate) fn new(msb: u64, lsb: u64) -> Self {
        Self {
            msb,
            lsb,
            created_at: Instant::now(),
            generation: AtomicI64::new(GENERATION_UNKNOWN),
            reclamation: Mutex::new(None),
            segment: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    /// Checks whether `lsb` belongs to a data segment identifier.
    #[must_use]
    pub const fn is_data_id(lsb: u64) -> bool {
        lsb >> 60 == DATA_NIBBLE
    }

    /// Checks whether `lsb` belongs to a bulk segment identifier.
    #[must_use]
    pub const fn is_bulk_id(lsb: u64) -> bool {
        lsb >> 60 == BULK_NIBBLE
    }

    /// Returns the most significant 64 bits.
    #[must_use]
    pub const fn msb(&self) -> u64 {
        self.msb
    }

    /// Returns the least significant 64 bits.
    #[must_use]
    pub const fn lsb(&self) -> u64 {
        self.lsb
    }

    /// Checks whether this is a data segment identifier.
    #[must_use]
    pub const fn is_data(&self) -> bool {
        Self::is_data_id(self.lsb)
    }

    /// Checks whether this is a bulk segment identifier.
    #[must_use]
    pub const fn is_bulk(&self) -> bool {
        Self::is_bulk_id(self.lsb)
    }

    /// Returns the currently memoised segment, if any.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<Segment>> {
        self.segment.read().clone()
    }

    /// Memoises a freshly loaded segment and records its generation.
    pub(crate) fn loaded(&self, segment: &Arc<Segment>) {
        *self.segment.write() = Some(Arc::clone(segment));
        if let Some(generation) = segment.generation() {
            self.generation
                .store(i64::from(generation.as_u32()), Ordering::Relaxed);
        }
    }

    /// Drops the memoised segment. Called when the 2nd-level cache evicts
    /// the entry; a later load repopulates the reference.
    pub(crate) fn unloaded(&self) {
        *self.segment.write() = None;
    }

    /// Returns the generation tag, if it has been learned from a load.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        match self.generation.load(Ordering::Relaxed) {
            GENERATION_UNKNOWN => None,
            g => Some(Generation::new(g as u32)),
        }
    }

    /// Notifies this id that its segment was reclaimed, e.g. by the
    /// garbage collector. The note is reported along with any later
    /// segment-not-found failure for this id.
    pub fn reclaimed(&self, note: impl Into<String>) {
        *self.reclamation.lock() = Some(note.into());
    }

    /// Returns the reclamation note, if the segment was reclaimed.
    #[must_use]
    pub fn reclamation(&self) -> Option<String> {
        self.reclamation.lock().clone()
    }

    /// Composes the diagnostic reported when the segment of this id cannot
    /// be resolved: its age, the reclamation note and the generation.
    #[must_use]
    pub fn gc_info(&self) -> String {
        let mut info = format!("age={}ms", self.created_at.elapsed().as_millis());
        if let Some(note) = self.reclamation.lock().as_deref() {
            info.push(',');
            info.push_str(note);
        }
        if let Some(generation) = self.generation() {
            info.push_str(&format!(",segment-generation={}", generation.as_u32()));
        }
        info
    }

    pub(crate) fn load_lock(&self) -> &Mutex<()> {
        &self.load_lock
    }
}

impl PartialEq for SegmentId {
    fn eq(&self, other: &Self) -> bool {
        self.msb == other.msb && self.lsb == other.lsb
    }
}

impl Eq for SegmentId {}

impl Hash for SegmentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.msb.hash(state);
        self.lsb.hash(state);
    }
}

impl PartialOrd for SegmentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.msb, self.lsb).cmp(&(other.msb, other.lsb))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_u64_pair(self.msb, self.lsb))
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", Uuid::from_u64_pair(self.msb, self.lsb))
    }
}

/// Per-store interning table of segment ids.
///
/// Guarantees exactly one [`SegmentId`] instance per `(msb, lsb)` pair for
/// the lifetime of the store, and mints identifiers for new segments.
#[derive(Default)]
pub struct SegmentTracker {
    ids: Mutex<HashMap<(u64, u64), Arc<SegmentId>>>,
}

impl SegmentTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical id instance for `(msb, lsb)`.
    pub fn intern(&self, msb: u64, lsb: u64) -> Arc<SegmentId> {
        let mut ids = self.ids.lock();
        Arc::clone(
            ids.entry((msb, lsb))
                .or_insert_with(|| Arc::new(SegmentId::new(msb, lsb))),
        )
    }

    /// Mints a fresh data segment id.
    pub fn new_data_segment_id(&self) -> Arc<SegmentId> {
        self.new_segment_id(DATA_NIBBLE)
    }

    /// Mints a fresh bulk segment id.
    pub fn new_bulk_segment_id(&self) -> Arc<SegmentId> {
        self.new_segment_id(BULK_NIBBLE)
    }

    fn new_segment_id(&self, nibble: u64) -> Arc<SegmentId> {
        let (msb, lsb) = Uuid::new_v4().as_u64_pair();
        let lsb = (lsb & 0x0FFF_FFFF_FFFF_FFFF) | (nibble << 60);
        self.intern(msb, lsb)
    }

    /// Returns the number of interned ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Returns `true` if no ids have been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// The identifier of a record: the segment holding it plus its record
/// number.
///
/// On the wire a record id takes 6 bytes, `(u16 segment index, u32 record
/// number)`, where the index points into the *enclosing* segment's
/// reference table.
#[derive(Clone)]
pub struct RecordId {
    segment_id: Arc<SegmentId>,
    number: u32,
}

impl RecordId {
    /// Creates a record id.
    #[must_use]
    pub fn new(segment_id: Arc<SegmentId>, number: u32) -> Self {
        Self { segment_id, number }
    }

    /// Returns the id of the segment holding the record.
    #[must_use]
    pub fn segment_id(&self) -> &Arc<SegmentId> {
        &self.segment_id
    }

    /// Returns the record number within the segment.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.segment_id == other.segment_id
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segment_id.hash(state);
        self.number.hash(state);
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08x}", self.segment_id, self.number)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}
