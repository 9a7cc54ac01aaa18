//! The segment store: the boundary between the engine and persistence.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::segment::records::BLOCK_SIZE;
use crate::segment::{RecordId, Segment, SegmentCache, SegmentId, SegmentTracker};
use arbordb_codec::{CodecError, StringValue, Template, RECORD_REF_BYTES};
use arbordb_storage::{FileBackend, InMemoryBackend, SegmentBackend};
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// The store contract consumed by the engine.
///
/// Implementations differ in where bytes live (memory, files, remotes);
/// none of that is visible above the writer pool.
pub trait SegmentStore: Send + Sync {
    /// Checks whether the store holds a segment for `id`.
    fn contains_segment(&self, id: &SegmentId) -> bool;

    /// Reads the segment identified by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentNotFound`] if the store has no such
    /// segment.
    fn read_segment(&self, id: &Arc<SegmentId>) -> CoreResult<Arc<Segment>>;

    /// Writes `len` bytes of `data` starting at `offset` as the segment
    /// identified by `id`. The segment is durable when this returns.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    fn write_segment(
        &self,
        id: &Arc<SegmentId>,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> CoreResult<()>;

    /// Returns the store's segment-id interning table.
    fn tracker(&self) -> &SegmentTracker;
}

/// A segment store over a persistence backend, with the interning tracker
/// and the 2nd-level segment cache.
pub struct Store {
    backend: Box<dyn SegmentBackend>,
    tracker: SegmentTracker,
    cache: SegmentCache,
    config: StoreConfig,
}

impl Store {
    /// Creates an in-memory store with the default configuration.
    #[must_use]
    pub fn memory() -> Self {
        Self::with_backend(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Opens a file-backed store in `dir` with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or is locked by another
    /// process.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        Self::open_with_config(dir, StoreConfig::default())
    }

    /// Opens a file-backed store in `dir`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or is locked by another
    /// process.
    pub fn open_with_config(dir: &Path, config: StoreConfig) -> CoreResult<Self> {
        let backend = FileBackend::open(dir)?;
        Ok(Self::with_backend(Box::new(backend), config))
    }

    /// Creates a store over an arbitrary backend.
    #[must_use]
    pub fn with_backend(backend: Box<dyn SegmentBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            tracker: SegmentTracker::new(),
            cache: SegmentCache::new(config.segment_cache_mb),
            config,
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the segment cache.
    #[must_use]
    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// Resolves `id` to its segment.
    ///
    /// This is the id-level read path: the cache serves the 1st-level
    /// reference memoised on the id first (still counting the hit) and
    /// falls back to a load through the backend.
    pub fn segment(&self, id: &Arc<SegmentId>) -> CoreResult<Arc<Segment>> {
        self.read_segment(id)
    }

    fn load_segment(&self, id: &Arc<SegmentId>) -> CoreResult<Arc<Segment>> {
        match self.backend.load(id.msb(), id.lsb())? {
            Some(data) => Ok(Arc::new(Segment::parse(
                Arc::clone(id),
                data,
                &self.tracker,
            )?)),
            None => {
                let gc_info = id.gc_info();
                error!(id = %id, gc_info = %gc_info, "segment not found");
                Err(CoreError::SegmentNotFound {
                    id: id.to_string(),
                    gc_info,
                })
            }
        }
    }

    /// Reads the string stored at `id`, following an out-of-line payload
    /// through its block list if necessary.
    ///
    /// # Errors
    ///
    /// Fails if the record is not a well-formed string or a referenced
    /// segment cannot be read.
    pub fn read_string(&self, id: &RecordId) -> CoreResult<String> {
        let segment = self.segment(id.segment_id())?;
        match segment.read_string(id.number())? {
            StringValue::Inline(value) => Ok(value),
            StringValue::External { id: r, length } => {
                let list_id = segment.resolve_ref(r)?;
                let blocks = self.read_list(&list_id)?;

                let mut bytes = Vec::with_capacity(length as usize);
                let mut remaining = length as usize;
                for block in &blocks {
                    let take = remaining.min(BLOCK_SIZE);
                    let block_segment = self.segment(block.segment_id())?;
                    bytes.extend_from_slice(block_segment.read_bytes(
                        block.number(),
                        0,
                        take,
                    )?);
                    remaining -= take;
                }
                if remaining > 0 {
                    return Err(CoreError::invalid_record(format!(
                        "string of {length} bytes is missing {remaining} bytes of blocks"
                    )));
                }
                String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8.into())
            }
        }
    }

    /// Reads the list record at `id` and returns the referenced ids in
    /// order, expanding the bucket tree.
    ///
    /// # Errors
    ///
    /// Fails if the record is not a well-formed list or a referenced
    /// segment cannot be read.
    pub fn read_list(&self, id: &RecordId) -> CoreResult<Vec<RecordId>> {
        let segment = self.segment(id.segment_id())?;
        let count = segment.read_u32(id.number(), 0)? as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let root = segment.read_record_id(id.number(), 4)?;
        let mut out = Vec::with_capacity(count);
        self.expand_bucket(&root, count, &mut out)?;
        Ok(out)
    }

    fn expand_bucket(
        &self,
        id: &RecordId,
        count: usize,
        out: &mut Vec<RecordId>,
    ) -> CoreResult<()> {
        use crate::segment::records::MAX_BUCKET_ENTRIES;

        if count == 1 {
            out.push(id.clone());
            return Ok(());
        }
        let mut bucket_size = 1;
        while bucket_size * MAX_BUCKET_ENTRIES < count {
            bucket_size *= MAX_BUCKET_ENTRIES;
        }
        let segment = self.segment(id.segment_id())?;
        let entries = count.div_ceil(bucket_size);
        for i in 0..entries {
            let child = segment.read_record_id(id.number(), i * RECORD_REF_BYTES)?;
            let span = bucket_size.min(count - i * bucket_size);
            self.expand_bucket(&child, span, out)?;
        }
        Ok(())
    }

    /// Reads the template record at `id`.
    ///
    /// # Errors
    ///
    /// Fails if the record is not a well-formed template.
    pub fn read_template(&self, id: &RecordId) -> CoreResult<Template> {
        let segment = self.segment(id.segment_id())?;
        segment.read_template(id.number())
    }
}

impl SegmentStore for Store {
    fn contains_segment(&self, id: &SegmentId) -> bool {
        matches!(self.backend.contains(id.msb(), id.lsb()), Ok(true))
    }

    fn read_segment(&self, id: &Arc<SegmentId>) -> CoreResult<Arc<Segment>> {
        self.cache.get_segment(id, || self.load_segment(id))
    }

    fn write_segment(
        &self,
        id: &Arc<SegmentId>,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> CoreResult<()> {
        let slice = data.get(offset..offset + len).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "segment write of {len} bytes at {offset} exceeds the {}-byte buffer",
                data.len()
            ))
        })?;
        self.backend.store(id.msb(), id.lsb(), slice)?;

        if id.is_data() {
            let segment = Arc::new(Segment::parse(
                Arc::clone(id),
                slice.to_vec(),
                &self.tracker,
            )?);
            self.cache.put_segment(&segment);
        }
        Ok(())
    }

    fn tracker(&self) -> &SegmentTracker {
        &self.tracker
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("interned_ids", &self.tracker.len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
