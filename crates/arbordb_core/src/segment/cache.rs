//! The 2nd-level segment cache.
//!
//! A weight-bounded, concurrent map from segment id to loaded segment.
//! Conceptually this is the 2nd level of a two-level cache: the 1st level
//! is the segment reference memoised on each [`SegmentId`]. Every eviction
//! from this cache clears the memoised reference through
//! [`SegmentId`]'s unload hook, so the two levels never disagree.
//!
//! Bulk segments are never inserted; they are loaded and returned
//! directly.

use crate::config::DEFAULT_SEGMENT_CACHE_MB;
use crate::error::{CoreError, CoreResult};
use crate::segment::id::SegmentId;
use crate::segment::Segment;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Fixed per-entry weight accounting for id and table metadata kept next
/// to the segment bytes.
const ENTRY_OVERHEAD: u64 = 1024;

/// A weight-bounded cache of data segments.
pub struct SegmentCache {
    max_weight: u64,
    entries: Mutex<LruCache<(u64, u64), Arc<Segment>>>,
    stats: Stats,
}

#[derive(Debug, Default)]
struct Stats {
    current_weight: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    load_success_count: AtomicU64,
    load_exception_count: AtomicU64,
    load_time_nanos: AtomicU64,
    eviction_count: AtomicU64,
}

impl SegmentCache {
    /// Creates a cache holding at most `cache_mb` megabytes of segments.
    #[must_use]
    pub fn new(cache_mb: usize) -> Self {
        Self {
            max_weight: cache_mb as u64 * 1024 * 1024,
            entries: Mutex::new(LruCache::unbounded()),
            stats: Stats::default(),
        }
    }

    fn weigh(segment: &Segment) -> u64 {
        segment.size() as u64 + ENTRY_OVERHEAD
    }

    /// Retrieves the segment for `id`, loading and caching it on a miss.
    ///
    /// The fast path consults the 1st-level reference on the id and counts
    /// a hit. On a miss the loader runs under the id's load lock (blocking
    /// I/O is fine there), its latency and outcome are recorded, and the
    /// loaded segment is inserted. Bulk segments bypass the cache and are
    /// returned directly.
    ///
    /// # Errors
    ///
    /// A missing segment is passed through unchanged; any other loader
    /// failure is counted and wrapped as [`CoreError::LoadFailure`].
    pub fn get_segment(
        &self,
        id: &Arc<SegmentId>,
        loader: impl FnOnce() -> CoreResult<Arc<Segment>>,
    ) -> CoreResult<Arc<Segment>> {
        if let Some(segment) = id.cached() {
            self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
            segment.access();
            return Ok(segment);
        }

        let _load_guard = id.load_lock().lock();
        if let Some(segment) = id.cached() {
            self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
            segment.access();
            return Ok(segment);
        }

        if id.is_bulk() {
            return loader();
        }

        let start = Instant::now();
        match loader() {
            Ok(segment) => {
                self.stats
                    .load_time_nanos
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                self.stats.load_success_count.fetch_add(1, Ordering::Relaxed);
                self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
                self.put(id, &segment);
                Ok(segment)
            }
            Err(e) => {
                self.stats
                    .load_exception_count
                    .fetch_add(1, Ordering::Relaxed);
                match e {
                    CoreError::SegmentNotFound { .. } => Err(e),
                    other => Err(CoreError::load_failure(other)),
                }
            }
        }
    }

    /// Puts a segment into the cache. Does nothing for bulk segments.
    pub fn put_segment(&self, segment: &Arc<Segment>) {
        if segment.id().is_bulk() {
            return;
        }
        self.put(segment.id(), segment);
    }

    fn put(&self, id: &Arc<SegmentId>, segment: &Arc<Segment>) {
        // Memoise on the id *before* the cache insert: if the insert
        // immediately evicts the entry again, the eviction hook clears the
        // reference and the two levels stay consistent.
        id.loaded(segment);

        let mut entries = self.entries.lock();
        if let Some(old) = entries.put((id.msb(), id.lsb()), Arc::clone(segment)) {
            self.stats
                .current_weight
                .fetch_sub(Self::weigh(&old), Ordering::Relaxed);
        }
        self.stats
            .current_weight
            .fetch_add(Self::weigh(segment), Ordering::Relaxed);
        self.evict_overflow(&mut entries);
    }

    /// Evicts least-recently-used entries until the weight fits. Segments
    /// whose access mark is set get one second chance per overflow pass.
    fn evict_overflow(&self, entries: &mut LruCache<(u64, u64), Arc<Segment>>) {
        while self.stats.current_weight.load(Ordering::Relaxed) > self.max_weight {
            let Some((key, victim)) = entries.pop_lru() else {
                break;
            };
            if victim.take_accessed() {
                entries.put(key, victim);
                continue;
            }
            self.evict(victim);
        }
    }

    fn evict(&self, victim: Arc<Segment>) {
        // The 1st-level reference is cleared before the weight drops.
        victim.id().unloaded();
        self.stats.eviction_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .current_weight
            .fetch_sub(Self::weigh(&victim), Ordering::Relaxed);
        debug!(id = %victim.id(), size = victim.size(), "evicted segment");
    }

    /// Invalidates every entry, triggering the eviction hook for each.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        while let Some((_, victim)) = entries.pop_lru() {
            self.evict(victim);
        }
    }

    /// Returns a snapshot of the cache statistics.
    ///
    /// Hits served from the 1st-level reference on the id are counted
    /// here as well; they are never hidden.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            element_count: self.entries.lock().len(),
            current_weight: self.stats.current_weight.load(Ordering::Relaxed),
            max_weight: self.max_weight,
            hit_count: self.stats.hit_count.load(Ordering::Relaxed),
            miss_count: self.stats.miss_count.load(Ordering::Relaxed),
            load_success_count: self.stats.load_success_count.load(Ordering::Relaxed),
            load_exception_count: self.stats.load_exception_count.load(Ordering::Relaxed),
            load_time_nanos: self.stats.load_time_nanos.load(Ordering::Relaxed),
            eviction_count: self.stats.eviction_count.load(Ordering::Relaxed),
        }
    }

    /// Resets the hit/miss/load/eviction counters. The element count and
    /// weight reflect live contents and are unaffected.
    pub fn reset_stats(&self) {
        self.stats.hit_count.store(0, Ordering::Relaxed);
        self.stats.miss_count.store(0, Ordering::Relaxed);
        self.stats.load_success_count.store(0, Ordering::Relaxed);
        self.stats.load_exception_count.store(0, Ordering::Relaxed);
        self.stats.load_time_nanos.store(0, Ordering::Relaxed);
        self.stats.eviction_count.store(0, Ordering::Relaxed);
    }
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_CACHE_MB)
    }
}

impl std::fmt::Debug for SegmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCache")
            .field("max_weight", &self.max_weight)
            .field("element_count", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Number of cached segments.
    pub element_count: usize,
    /// Combined weight of the cached segments.
    pub current_weight: u64,
    /// Maximum weight the cache is allowed to hold.
    pub max_weight: u64,
    /// Number of lookups answered from either cache level.
    pub hit_count: u64,
    /// Number of lookups that had to load.
    pub miss_count: u64,
    /// Number of loads that succeeded.
    pub load_success_count: u64,
    /// Number of loads that failed.
    pub load_exception_count: u64,
    /// Total time spent in successful loads, in nanoseconds.
    pub load_time_nanos: u64,
    /// Number of evictions, including explicit invalidations.
    pub eviction_count: u64,
}

impl CacheStats {
    /// Total number of lookups: hits plus misses.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }
}
