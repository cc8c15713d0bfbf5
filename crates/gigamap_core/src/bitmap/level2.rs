//! Bitmap Level2 segments: one block of 64-bit presence words.

use super::layout::{self, BlockLayout};
use crate::error::CoreResult;

#[derive(Clone)]
enum Words {
    /// Working form: one slot per word.
    Dense(Box<[u64]>),
    /// Storage form: a validated encoded block.
    Encoded(Box<[u8]>),
}

/// A block of `2^exponent` words covering `64 * 2^exponent` consecutive IDs.
///
/// A segment is never empty while it is referenced: the owning Level3
/// segment drops the pointer as soon as the last bit is cleared.
#[derive(Clone)]
pub struct BitmapLevel2 {
    words: Words,
    exponent: u32,
    populated: usize,
}

impl BitmapLevel2 {
    /// Creates a zeroed, decompressed segment.
    #[must_use]
    pub fn new(exponent: u32) -> Self {
        Self {
            words: Words::Dense(vec![0u64; 1 << exponent].into_boxed_slice()),
            exponent,
            populated: 0,
        }
    }

    /// Number of words in the segment.
    #[must_use]
    pub fn word_count(&self) -> usize {
        1 << self.exponent
    }

    /// Number of non-zero words.
    #[must_use]
    pub fn populated_words(&self) -> usize {
        self.populated
    }

    /// Checks if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Whether the segment currently holds its encoded form.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        matches!(self.words, Words::Encoded(_))
    }

    /// Reads one word. Works in both forms.
    #[must_use]
    pub fn word(&self, index: usize) -> u64 {
        match &self.words {
            Words::Dense(words) => words[index],
            Words::Encoded(bytes) => layout::read_word(bytes, index),
        }
    }

    /// Tests one bit.
    #[must_use]
    pub fn contains(&self, word_index: usize, bit: u32) -> bool {
        self.word(word_index) & (1u64 << bit) != 0
    }

    /// Sets one bit, decompressing first if needed. Returns whether it changed.
    pub fn set(&mut self, word_index: usize, bit: u32) -> bool {
        let words = self.dense_mut();
        let before = words[word_index];
        let after = before | (1u64 << bit);
        if before == after {
            return false;
        }
        words[word_index] = after;
        if before == 0 {
            self.populated += 1;
        }
        true
    }

    /// Clears one bit, decompressing first if needed. Returns whether it changed.
    pub fn clear(&mut self, word_index: usize, bit: u32) -> bool {
        if !self.contains(word_index, bit) {
            return false;
        }
        let words = self.dense_mut();
        words[word_index] &= !(1u64 << bit);
        if words[word_index] == 0 {
            self.populated -= 1;
        }
        true
    }

    /// Number of set bits.
    #[must_use]
    pub fn bit_count(&self) -> u64 {
        (0..self.word_count())
            .map(|i| u64::from(self.word(i).count_ones()))
            .sum()
    }

    /// Copies every word into `out`.
    pub fn copy_words(&self, out: &mut [u64]) {
        match &self.words {
            Words::Dense(words) => out.copy_from_slice(words),
            Words::Encoded(bytes) => layout::decode_into(bytes, out),
        }
    }

    /// Switches to the encoded form, picking the smaller layout.
    pub fn ensure_compressed(&mut self) {
        if let Words::Dense(words) = &self.words {
            let layout = layout::preferred_layout(words.len(), self.populated);
            let bytes = layout::encode(words, self.exponent, layout);
            self.words = Words::Encoded(bytes.into_boxed_slice());
        }
    }

    /// Switches to the working form.
    pub fn ensure_decompressed(&mut self) {
        self.dense_mut();
    }

    /// Encodes the segment for storage without changing its in-memory form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.words {
            Words::Encoded(bytes) => bytes.to_vec(),
            Words::Dense(words) => {
                let layout = layout::preferred_layout(words.len(), self.populated);
                layout::encode(words, self.exponent, layout)
            }
        }
    }

    /// Encodes the segment densely for storage, bypassing compression.
    #[must_use]
    pub fn to_dense_bytes(&self) -> Vec<u8> {
        let mut words = vec![0u64; self.word_count()];
        self.copy_words(&mut words);
        layout::encode(&words, self.exponent, BlockLayout::Dense)
    }

    /// Validates an encoded block and wraps it without decoding.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::SegmentCorruption`] if the bytes fail the
    /// layout check for the given exponent.
    pub fn from_bytes(bytes: Vec<u8>, exponent: u32) -> CoreResult<Self> {
        let header = layout::validate(&bytes, exponent)?;
        Ok(Self {
            words: Words::Encoded(bytes.into_boxed_slice()),
            exponent,
            populated: header.populated,
        })
    }

    fn dense_mut(&mut self) -> &mut [u64] {
        if let Words::Encoded(bytes) = &self.words {
            let mut words = vec![0u64; 1 << self.exponent];
            layout::decode_into(bytes, &mut words);
            self.words = Words::Dense(words.into_boxed_slice());
        }
        match &mut self.words {
            Words::Dense(words) => words,
            Words::Encoded(_) => &mut [],
        }
    }
}

impl std::fmt::Debug for BitmapLevel2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapLevel2")
            .field("words", &self.word_count())
            .field("populated", &self.populated)
            .field("compressed", &self.is_compressed())
            .finish()
    }
}
