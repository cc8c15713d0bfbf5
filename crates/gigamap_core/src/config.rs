//! Map configuration.

use crate::error::{CoreError, CoreResult};

/// Bits in one bitmap word.
pub(crate) const WORD_BITS_EXPONENT: u32 = 6;

/// Configuration for creating a [`crate::GigaMap`].
///
/// Segment sizes are fixed for the lifetime of a map. Changing them means
/// building a new map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GigaMapConfig {
    /// Entity slots per Level1 segment, as a power of two.
    pub level1_exponent: u32,

    /// Level1 segments per Level2 segment, as a power of two.
    pub level2_exponent: u32,

    /// Initial Level3 capacity, as a power of two.
    pub level3_min_exponent: u32,

    /// Maximum Level3 capacity, as a power of two.
    pub level3_max_exponent: u32,

    /// 64-bit words per bitmap Level2 segment, as a power of two.
    pub bitmap_block_exponent: u32,

    /// Whether bitmap segments are compressed before they are stored.
    pub compress_on_store: bool,
}

impl Default for GigaMapConfig {
    fn default() -> Self {
        Self {
            level1_exponent: 8,        // 256 entities
            level2_exponent: 12,       // 4096 Level1 segments
            level3_min_exponent: 0,
            level3_max_exponent: 43,
            bitmap_block_exponent: 8,  // 256 words = 16384 IDs
            compress_on_store: true,
        }
    }
}

impl GigaMapConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Level1 segment size exponent.
    #[must_use]
    pub const fn level1_exponent(mut self, value: u32) -> Self {
        self.level1_exponent = value;
        self
    }

    /// Sets the Level2 segment size exponent.
    #[must_use]
    pub const fn level2_exponent(mut self, value: u32) -> Self {
        self.level2_exponent = value;
        self
    }

    /// Sets the Level3 minimum and maximum capacity exponents.
    #[must_use]
    pub const fn level3_exponents(mut self, min: u32, max: u32) -> Self {
        self.level3_min_exponent = min;
        self.level3_max_exponent = max;
        self
    }

    /// Sets the bitmap block exponent.
    #[must_use]
    pub const fn bitmap_block_exponent(mut self, value: u32) -> Self {
        self.bitmap_block_exponent = value;
        self
    }

    /// Sets whether bitmap segments are compressed before storing.
    #[must_use]
    pub const fn compress_on_store(mut self, value: bool) -> Self {
        self.compress_on_store = value;
        self
    }

    /// A small geometry that makes segment boundaries easy to hit in tests.
    #[must_use]
    pub fn compact() -> Self {
        Self::default()
            .level1_exponent(2)
            .level2_exponent(2)
            .level3_exponents(0, 20)
            .bitmap_block_exponent(2)
    }

    /// Checks that the exponents describe an addressable geometry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] describing the first problem found.
    pub fn validate(&self) -> CoreResult<()> {
        if self.level1_exponent == 0 || self.level1_exponent > 20 {
            return Err(CoreError::invalid_configuration(format!(
                "level1 exponent must be in 1..=20, got {}",
                self.level1_exponent
            )));
        }
        if self.level2_exponent == 0 || self.level2_exponent > 20 {
            return Err(CoreError::invalid_configuration(format!(
                "level2 exponent must be in 1..=20, got {}",
                self.level2_exponent
            )));
        }
        if self.level3_min_exponent > self.level3_max_exponent {
            return Err(CoreError::invalid_configuration(format!(
                "level3 minimum exponent {} exceeds maximum {}",
                self.level3_min_exponent, self.level3_max_exponent
            )));
        }
        if self.level1_exponent + self.level2_exponent + self.level3_max_exponent > 63 {
            return Err(CoreError::invalid_configuration(format!(
                "level exponents {} + {} + {} exceed 63 bits",
                self.level1_exponent, self.level2_exponent, self.level3_max_exponent
            )));
        }
        if self.bitmap_block_exponent > 16 {
            return Err(CoreError::invalid_configuration(format!(
                "bitmap block exponent must be at most 16, got {}",
                self.bitmap_block_exponent
            )));
        }
        Ok(())
    }

    /// Entity slots per Level1 segment.
    #[must_use]
    pub const fn level1_len(&self) -> usize {
        1 << self.level1_exponent
    }

    /// Level1 segments per Level2 segment.
    #[must_use]
    pub const fn level2_len(&self) -> usize {
        1 << self.level2_exponent
    }

    /// Initial Level3 capacity.
    #[must_use]
    pub const fn level3_min_len(&self) -> usize {
        1 << self.level3_min_exponent
    }

    /// Maximum Level3 capacity.
    #[must_use]
    pub const fn level3_max_len(&self) -> usize {
        1 << self.level3_max_exponent
    }

    /// Maximum number of addressable entities.
    #[must_use]
    pub const fn max_entities(&self) -> u64 {
        1u64 << (self.level1_exponent + self.level2_exponent + self.level3_max_exponent)
    }

    /// Words per bitmap Level2 segment.
    #[must_use]
    pub const fn bitmap_block_words(&self) -> usize {
        1 << self.bitmap_block_exponent
    }

    /// IDs covered by one bitmap Level2 segment.
    #[must_use]
    pub const fn bitmap_block_ids(&self) -> u64 {
        1u64 << (self.bitmap_block_exponent + WORD_BITS_EXPONENT)
    }
}
