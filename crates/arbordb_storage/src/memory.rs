//! In-memory segment backend for testing.

use crate::backend::SegmentBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-memory segment backend.
///
/// Stores all segments in a map and is suitable for unit tests,
/// integration tests and ephemeral stores that don't need persistence.
///
/// # Example
///
/// ```rust
/// use arbordb_storage::{InMemoryBackend, SegmentBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.store(1, 2, b"segment bytes").unwrap();
/// assert!(backend.contains(1, 2).unwrap());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    segments: RwLock<HashMap<(u64, u64), Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    /// Returns `true` if no segments are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Removes all stored segments.
    pub fn clear(&self) {
        self.segments.write().clear();
    }
}

impl SegmentBackend for InMemoryBackend {
    fn contains(&self, msb: u64, lsb: u64) -> StorageResult<bool> {
        Ok(self.segments.read().contains_key(&(msb, lsb)))
    }

    fn load(&self, msb: u64, lsb: u64) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.segments.read().get(&(msb, lsb)).cloned())
    }

    fn store(&self, msb: u64, lsb: u64, data: &[u8]) -> StorageResult<()> {
        self.segments.write().insert((msb, lsb), data.to_vec());
        Ok(())
    }

    fn ids(&self) -> StorageResult<Vec<(u64, u64)>> {
        Ok(self.segments.read().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
        assert!(!backend.contains(0, 0).unwrap());
        assert_eq!(backend.load(0, 0).unwrap(), None);
    }

    #[test]
    fn memory_store_and_load() {
        let backend = InMemoryBackend::new();
        backend.store(7, 11, b"hello").unwrap();

        assert!(backend.contains(7, 11).unwrap());
        assert_eq!(backend.load(7, 11).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn memory_ids_lists_all() {
        let backend = InMemoryBackend::new();
        backend.store(1, 1, b"a").unwrap();
        backend.store(2, 2, b"b").unwrap();

        let mut ids = backend.ids().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn memory_clear() {
        let backend = InMemoryBackend::new();
        backend.store(1, 1, b"a").unwrap();
        backend.clear();
        assert!(backend.is_empty());
    }
}
