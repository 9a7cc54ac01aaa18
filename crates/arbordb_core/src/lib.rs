//! # arbordb core
//!
//! The segment storage engine of the arbordb content repository.
//!
//! The engine persists an immutable, content-addressed graph of fixed-size
//! binary segments, each packed with variable-length records. Readers
//! navigate records through stable [`RecordId`]s; writers append records
//! into buffered segments and flush them atomically.
//!
//! - [`segment`]: segments, ids, the buffered writer, the writer pool
//!   and the two-level segment cache
//! - [`Store`]: the concrete store over a persistence backend
//! - [`SegmentWriter`]: the write surface with interning caches
//! - [`StoreConfig`]: the tunables

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod segment;
mod store;
mod types;
mod writer;

pub use config::{StoreConfig, DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SEGMENT_CACHE_MB};
pub use error::{CoreError, CoreResult};
pub use segment::{
    CacheStats, GenerationSupplier, RecordId, Segment, SegmentBufferWriter,
    SegmentBufferWriterPool, SegmentCache, SegmentId, SegmentTracker,
};
pub use store::{SegmentStore, Store};
pub use types::{Generation, RecordType};
pub use writer::{NodeCache, SegmentWriter};
