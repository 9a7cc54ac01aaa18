//! Segment backend trait definition.

use crate::error::StorageResult;

/// A low-level persistence backend for segments.
///
/// Backends are **opaque byte stores** keyed by 128-bit segment identity.
/// They never interpret segment contents; headers, record tables and
/// payload layout all belong to the layers above.
///
/// # Invariants
///
/// - `store` is durable on return and a segment, once stored, is never
///   modified
/// - `load` returns exactly the bytes previously stored under the identity
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - for tests and ephemeral stores
/// - [`super::FileBackend`] - one file per segment on disk
pub trait SegmentBackend: Send + Sync {
    /// Checks whether a segment exists under the given identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn contains(&self, msb: u64, lsb: u64) -> StorageResult<bool>;

    /// Loads the bytes of the segment stored under the given identity, or
    /// `None` if no such segment exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn load(&self, msb: u64, lsb: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Stores a segment under the given identity.
    ///
    /// After this returns successfully, the segment is guaranteed to
    /// survive process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn store(&self, msb: u64, lsb: u64, data: &[u8]) -> StorageResult<()>;

    /// Lists the identities of all stored segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be enumerated.
    fn ids(&self) -> StorageResult<Vec<(u64, u64)>>;
}
