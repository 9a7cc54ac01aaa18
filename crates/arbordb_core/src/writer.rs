//! The segment writer: the write surface over the pool, with interning
//! caches for records that repeat across nodes.

use crate::config::StoreConfig;
use crate::error::CoreResult;
use crate::segment::records::{self, MapEntry, TemplateDescriptor};
use crate::segment::{GenerationSupplier, RecordId, SegmentBufferWriterPool};
use crate::store::SegmentStore;
use crate::types::Generation;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A cache of node records keyed by their stable id, split across tree
/// depth levels.
///
/// The configured size is divided evenly over the depth levels so that
/// records deep in the tree cannot push the heavily shared records near
/// the root out of the cache. Consumers building node trees consult it to
/// avoid rewriting unchanged nodes.
pub struct NodeCache {
    levels: Vec<Mutex<LruCache<String, RecordId>>>,
}

impl NodeCache {
    fn new(size: usize, depth: usize) -> Self {
        let depth = depth.max(1);
        let per_level = NonZeroUsize::new((size / depth).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let levels = (0..depth)
            .map(|_| Mutex::new(LruCache::new(per_level)))
            .collect();
        Self { levels }
    }

    fn level(&self, depth: usize) -> &Mutex<LruCache<String, RecordId>> {
        &self.levels[depth.min(self.levels.len() - 1)]
    }

    /// Records the node written for `stable_id` at tree depth `depth`.
    pub fn put(&self, stable_id: &str, id: RecordId, depth: usize) {
        self.level(depth).lock().put(stable_id.to_string(), id);
    }

    /// Looks up the node previously written for `stable_id` at `depth`.
    #[must_use]
    pub fn get(&self, stable_id: &str, depth: usize) -> Option<RecordId> {
        self.level(depth).lock().get(stable_id).cloned()
    }
}

/// Writes records through a pool of buffered segment writers.
///
/// Recently written strings and templates are interned: writing the same
/// value again returns the previous record id instead of a new record.
/// Both caches (and the node cache exposed for node builders) are bounded
/// by the store configuration; a size of `0` disables them.
pub struct SegmentWriter {
    pool: SegmentBufferWriterPool,
    strings: Option<Mutex<LruCache<String, RecordId>>>,
    templates: Option<Mutex<LruCache<TemplateDescriptor, RecordId>>>,
    nodes: Option<NodeCache>,
}

impl SegmentWriter {
    /// Creates a writer over `store`. `name` prefixes the ids of the
    /// pooled buffered writers; `generation` is consulted whenever a
    /// writer is minted.
    pub fn new(
        store: Arc<dyn SegmentStore>,
        name: impl Into<String>,
        generation: GenerationSupplier,
        config: &StoreConfig,
    ) -> Self {
        fn lru<K: std::hash::Hash + Eq>(size: usize) -> Option<Mutex<LruCache<K, RecordId>>> {
            NonZeroUsize::new(size).map(|capacity| Mutex::new(LruCache::new(capacity)))
        }
        Self {
            pool: SegmentBufferWriterPool::new(
                store,
                name,
                generation,
                config.max_segment_size,
            ),
            strings: lru(config.strings_cache_size),
            templates: lru(config.templates_cache_size),
            nodes: (config.nodes_cache_size > 0)
                .then(|| NodeCache::new(config.nodes_cache_size, config.nodes_cache_depth)),
        }
    }

    /// Returns the generation new buffered writers are created in.
    #[must_use]
    pub fn current_generation(&self) -> Generation {
        self.pool.current_generation()
    }

    /// Returns the node record cache, if enabled.
    #[must_use]
    pub fn node_cache(&self) -> Option<&NodeCache> {
        self.nodes.as_ref()
    }

    /// Writes a string, reusing the record of a recently written equal
    /// string.
    pub fn write_string(&self, value: &str) -> CoreResult<RecordId> {
        if let Some(cache) = &self.strings {
            if let Some(id) = cache.lock().get(value) {
                return Ok(id.clone());
            }
        }
        let id = self.pool.execute(|w| records::write_string(w, value))?;
        if let Some(cache) = &self.strings {
            cache.lock().put(value.to_string(), id.clone());
        }
        Ok(id)
    }

    /// Writes a value record.
    pub fn write_value(&self, data: &[u8]) -> CoreResult<RecordId> {
        self.pool.execute(|w| records::write_value(w, data))
    }

    /// Writes a raw block record.
    pub fn write_block(&self, data: &[u8]) -> CoreResult<RecordId> {
        self.pool.execute(|w| records::write_block(w, data))
    }

    /// Writes a blob identifier record.
    pub fn write_blob_id(&self, blob_id: &[u8]) -> CoreResult<RecordId> {
        self.pool.execute(|w| records::write_blob_id(w, blob_id))
    }

    /// Writes a list record over `ids`.
    pub fn write_list(&self, ids: &[RecordId]) -> CoreResult<RecordId> {
        self.pool.execute(|w| records::write_list(w, ids))
    }

    /// Writes a map leaf record.
    pub fn write_map_leaf(&self, level: u32, entries: &[MapEntry]) -> CoreResult<RecordId> {
        self.pool
            .execute(|w| records::write_map_leaf(w, level, entries))
    }

    /// Writes a map branch record.
    pub fn write_map_branch(
        &self,
        level: u32,
        entry_count: u32,
        bitmap: u32,
        ids: &[RecordId],
    ) -> CoreResult<RecordId> {
        self.pool
            .execute(|w| records::write_map_branch(w, level, entry_count, bitmap, ids))
    }

    /// Writes a template record, reusing the record of a recently written
    /// equal template.
    pub fn write_template(&self, template: &TemplateDescriptor) -> CoreResult<RecordId> {
        if let Some(cache) = &self.templates {
            if let Some(id) = cache.lock().get(template) {
                return Ok(id.clone());
            }
        }
        let id = self
            .pool
            .execute(|w| records::write_template(w, template))?;
        if let Some(cache) = &self.templates {
            cache.lock().put(template.clone(), id.clone());
        }
        Ok(id)
    }

    /// Writes a node record.
    pub fn write_node(
        &self,
        stable_id: Option<&RecordId>,
        ids: &[RecordId],
    ) -> CoreResult<RecordId> {
        self.pool
            .execute(|w| records::write_node(w, stable_id, ids))
    }

    /// Flushes every buffered writer of the pool, making all records
    /// written so far durably readable.
    pub fn flush(&self) -> CoreResult<()> {
        self.pool.flush()
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("pool", &self.pool)
            .field("strings_cache", &self.strings.is_some())
            .field("templates_cache", &self.templates.is_some())
            .finish_non_exhaustive()
    }
}
