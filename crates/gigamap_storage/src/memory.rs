//! In-memory segment store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::{SegmentHandle, SegmentStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory segment store.
///
/// This store keeps all segments in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Exercising segment eviction without touching the file system
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use gigamap_storage::{InMemorySegmentStore, SegmentStore};
///
/// let store = InMemorySegmentStore::new();
/// let handle = store.allocate();
/// store.write(handle, b"test data").unwrap();
/// assert_eq!(store.segment_count(), 1);
/// ```
#[derive(Debug)]
pub struct InMemorySegmentStore {
    segments: RwLock<HashMap<SegmentHandle, Vec<u8>>>,
    next_handle: AtomicU64,
}

impl Default for InMemorySegmentStore {
    fn default() -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl InMemorySegmentStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored bytes of a segment without any checks.
    ///
    /// Useful for testing how segment loaders react to damaged bytes.
    pub fn corrupt(&self, handle: SegmentHandle, bytes: Vec<u8>) {
        self.segments.write().insert(handle, bytes);
    }

    /// Returns the total number of stored bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.segments.read().values().map(Vec::len).sum()
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn allocate(&self) -> SegmentHandle {
        SegmentHandle::allocated(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn write(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()> {
        self.segments.write().insert(handle, bytes.to_vec());
        Ok(())
    }

    fn read(&self, handle: SegmentHandle) -> StorageResult<Vec<u8>> {
        self.segments
            .read()
            .get(&handle)
            .cloned()
            .ok_or(StorageError::SegmentNotFound(handle))
    }

    fn remove(&self, handle: SegmentHandle) -> StorageResult<()> {
        self.segments.write().remove(&handle);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        // In-memory store has no pending writes
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.segments.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemorySegmentStore::new();
        assert_eq!(store.segment_count(), 0);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn allocate_never_repeats() {
        let store = InMemorySegmentStore::new();
        let a = store.allocate();
        let b = store.allocate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn write_then_read() {
        let store = InMemorySegmentStore::new();
        let handle = store.allocate();
        store.write(handle, b"hello").unwrap();
        assert_eq!(store.read(handle).unwrap(), b"hello");
    }

    #[test]
    fn write_replaces_previous_bytes() {
        let store = InMemorySegmentStore::new();
        let handle = store.allocate();
        store.write(handle, b"first").unwrap();
        store.write(handle, b"second").unwrap();
        assert_eq!(store.read(handle).unwrap(), b"second");
        assert_eq!(store.segment_count(), 1);
    }

    #[test]
    fn read_unknown_handle_fails() {
        let store = InMemorySegmentStore::new();
        let handle = store.allocate();
        let result = store.read(handle);
        assert!(matches!(result, Err(StorageError::SegmentNotFound(h)) if h == handle));
    }

    #[test]
    fn remove_forgets_segment() {
        let store = InMemorySegmentStore::new();
        let handle = store.allocate();
        store.write(handle, b"bytes").unwrap();
        store.remove(handle).unwrap();
        assert!(store.read(handle).is_err());
        assert_eq!(store.segment_count(), 0);
    }
}
