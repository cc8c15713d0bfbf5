//! Segment store trait definition.

use crate::error::StorageResult;
use std::fmt;

/// Identifies one stored segment.
///
/// Handles start at 1; zero is reserved so segment layouts can encode
/// "no segment" as a zero handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentHandle(u64);

impl SegmentHandle {
    /// Creates a handle from its raw value.
    ///
    /// Returns `None` for the reserved zero value.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Handle for a value drawn from an allocation counter that starts at 1.
    pub(crate) const fn allocated(raw: u64) -> Self {
        Self(if raw == 0 { 1 } else { raw })
    }

    /// Returns the raw handle value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentHandle({})", self.0)
    }
}

impl fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// A store of opaque segment bytes addressed by [`SegmentHandle`].
///
/// # Invariants
///
/// - `allocate` never returns the same handle twice for one store
/// - `read` returns exactly the bytes of the last `write` to that handle
/// - `flush` makes all previous writes durable (where the store is durable)
///
/// # Implementors
///
/// - [`super::InMemorySegmentStore`] - For testing
/// - [`super::FileSegmentStore`] - For persistent storage
pub trait SegmentStore: Send + Sync {
    /// Allocates a fresh handle. No bytes are associated with it yet.
    fn allocate(&self) -> SegmentHandle;

    /// Stores `bytes` under `handle`, replacing any previous bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()>;

    /// Reads the bytes stored under `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::SegmentNotFound`] if nothing is stored
    /// under the handle, or an I/O error.
    fn read(&self, handle: SegmentHandle) -> StorageResult<Vec<u8>>;

    /// Forgets the bytes stored under `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn remove(&self, handle: SegmentHandle) -> StorageResult<()>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Returns the number of handles that currently have bytes.
    fn segment_count(&self) -> usize;
}
