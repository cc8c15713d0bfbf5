//! Core type definitions for GigaMap.

use std::fmt;

/// Identifier of a registered index.
///
/// Index IDs are assigned in registration order and never reused, even
/// after the index is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(pub u32);

impl IndexId {
    /// Pseudo index owning the live-ID bitmap of a map.
    pub const LIVE: Self = Self(u32::MAX);

    /// Creates a new index ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::LIVE {
            write!(f, "idx:live")
        } else {
            write!(f, "idx:{}", self.0)
        }
    }
}

/// Identity of one bitmap within a map.
///
/// `sub` is the component position for composite indices and 0 otherwise;
/// `entry` is the stable position of the bitmap entry within its (sub-)index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitmapOwner {
    /// Owning index.
    pub index: IndexId,
    /// Sub-index position.
    pub sub: u32,
    /// Entry position.
    pub entry: u32,
}

impl BitmapOwner {
    /// Creates a bitmap owner.
    #[must_use]
    pub const fn new(index: IndexId, sub: u32, entry: u32) -> Self {
        Self { index, sub, entry }
    }

    /// The owner of the live-ID bitmap.
    #[must_use]
    pub const fn live() -> Self {
        Self::new(IndexId::LIVE, 0, 0)
    }
}
