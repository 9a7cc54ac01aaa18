//! Store configuration.

/// Default maximum weight of the segment cache in megabytes.
pub const DEFAULT_SEGMENT_CACHE_MB: usize = 256;

/// Default maximum size of a segment in bytes.
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 256 * 1024;

/// Configuration for a segment store and its writers.
///
/// Every knob has a single effect; none are read from the environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum weight of the segment cache in megabytes.
    pub segment_cache_mb: usize,

    /// Maximum size of a single segment in bytes. Buffered writers flush
    /// and start a new segment when the next record would exceed it.
    pub max_segment_size: usize,

    /// Number of recently written strings interned by the segment writer.
    /// `0` disables the cache.
    pub strings_cache_size: usize,

    /// Number of recently written templates interned by the segment
    /// writer. `0` disables the cache.
    pub templates_cache_size: usize,

    /// Total number of node records tracked by the writer's node cache.
    /// `0` disables the cache.
    pub nodes_cache_size: usize,

    /// Number of tree-depth levels the node cache is split across.
    pub nodes_cache_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_cache_mb: DEFAULT_SEGMENT_CACHE_MB,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            strings_cache_size: 15_000,
            templates_cache_size: 3_000,
            nodes_cache_size: 1_000_000,
            nodes_cache_depth: 20,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum weight of the segment cache in megabytes.
    #[must_use]
    pub const fn segment_cache_mb(mut self, mb: usize) -> Self {
        self.segment_cache_mb = mb;
        self
    }

    /// Sets the maximum segment size in bytes.
    #[must_use]
    pub const fn max_segment_size(mut self, bytes: usize) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Sets the string interning cache size. `0` disables it.
    #[must_use]
    pub const fn strings_cache_size(mut self, size: usize) -> Self {
        self.strings_cache_size = size;
        self
    }

    /// Sets the template interning cache size. `0` disables it.
    #[must_use]
    pub const fn templates_cache_size(mut self, size: usize) -> Self {
        self.templates_cache_size = size;
        self
    }

    /// Sets the node record cache size. `0` disables it.
    #[must_use]
    pub const fn nodes_cache_size(mut self, size: usize) -> Self {
        self.nodes_cache_size = size;
        self
    }

    /// Sets the number of depth levels of the node record cache.
    #[must_use]
    pub const fn nodes_cache_depth(mut self, depth: usize) -> Self {
        self.nodes_cache_depth = depth;
        self
    }
}
