//! Entity identifier.

use crate::config::GigaMapConfig;
use std::fmt;

/// Identifier of an entity in a [`crate::GigaMap`].
///
/// Entity IDs are:
/// - Assigned sequentially from 0 on add
/// - Never reused, never decreasing
/// - Split by fixed bit shifts into a three-level storage address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntityId(u64);

impl EntityId {
    /// Creates an entity ID from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw ID value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the ID following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Splits the ID into its entity store address.
    #[must_use]
    pub fn address(self, config: &GigaMapConfig) -> EntityAddress {
        let level1_mask = (1u64 << config.level1_exponent) - 1;
        let level2_mask = (1u64 << config.level2_exponent) - 1;
        EntityAddress {
            level3: (self.0 >> (config.level1_exponent + config.level2_exponent)) as usize,
            level2: ((self.0 >> config.level1_exponent) & level2_mask) as usize,
            level1: (self.0 & level1_mask) as usize,
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Position of an entity slot in the three-level entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityAddress {
    /// Index of the Level2 segment within Level3.
    pub level3: usize,
    /// Index of the Level1 segment within its Level2 segment.
    pub level2: usize,
    /// Slot within the Level1 segment.
    pub level1: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_of_zero() {
        let config = GigaMapConfig::default();
        let address = EntityId::new(0).address(&config);
        assert_eq!(
            address,
            EntityAddress {
                level3: 0,
                level2: 0,
                level1: 0
            }
        );
    }

    #[test]
    fn address_splits_by_exponents() {
        let config = GigaMapConfig::compact(); // 4 slots, 4 segments
        // 0b11_10_01 = level3 3, level2 2, level1 1
        let address = EntityId::new(0b11_10_01).address(&config);
        assert_eq!(address.level3, 3);
        assert_eq!(address.level2, 2);
        assert_eq!(address.level1, 1);
    }

    #[test]
    fn ordering_and_next() {
        let a = EntityId::new(4);
        assert!(a < a.next());
        assert_eq!(a.next().as_u64(), 5);
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", EntityId::new(42)), "42");
        assert_eq!(format!("{:?}", EntityId::new(42)), "EntityId(42)");
    }
}
