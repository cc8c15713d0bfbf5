//! Composed bitmap query results.
//!
//! A [`BitmapResult`] is a tree over borrowed bit tables. Nothing is
//! materialized up front: evaluation walks the tree one block at a time, so
//! AND and OR across many keys never build full ID lists.

use super::level3::BitmapLevel3;
use crate::config::WORD_BITS_EXPONENT;
use crate::entity::EntityId;
use crate::error::CoreResult;

/// The result of evaluating a condition against an index.
///
/// Never absent: a lookup that matches nothing yields [`BitmapResult::Empty`].
#[derive(Debug, Clone)]
pub enum BitmapResult<'a> {
    /// Matches nothing.
    Empty,
    /// One key's bitmap.
    Bitmap(&'a BitmapLevel3),
    /// Intersection of all children.
    And(Vec<BitmapResult<'a>>),
    /// Union of all children.
    Or(Vec<BitmapResult<'a>>),
    /// Every live ID not matched by `inner`.
    Not {
        /// The negated result.
        inner: Box<BitmapResult<'a>>,
        /// The live-ID bitmap the negation is taken against.
        universe: &'a BitmapLevel3,
    },
}

impl<'a> BitmapResult<'a> {
    /// Intersects results, folding away trivial cases.
    #[must_use]
    pub fn and(children: Vec<BitmapResult<'a>>) -> Self {
        if children.iter().any(|c| matches!(c, BitmapResult::Empty)) {
            return BitmapResult::Empty;
        }
        let mut children: Vec<_> = children
            .into_iter()
            .flat_map(|child| match child {
                BitmapResult::And(inner) => inner,
                other => vec![other],
            })
            .collect();
        match children.len() {
            0 => BitmapResult::Empty,
            1 => children.remove(0),
            _ => BitmapResult::And(children),
        }
    }

    /// Unites results, folding away trivial cases.
    #[must_use]
    pub fn or(children: Vec<BitmapResult<'a>>) -> Self {
        let mut children: Vec<_> = children
            .into_iter()
            .flat_map(|child| match child {
                BitmapResult::Or(inner) => inner,
                BitmapResult::Empty => Vec::new(),
                other => vec![other],
            })
            .collect();
        match children.len() {
            0 => BitmapResult::Empty,
            1 => children.remove(0),
            _ => BitmapResult::Or(children),
        }
    }

    /// Negates a result relative to the live IDs.
    #[must_use]
    pub fn not(inner: BitmapResult<'a>, universe: &'a BitmapLevel3) -> Self {
        match inner {
            BitmapResult::Empty => BitmapResult::Bitmap(universe),
            inner => BitmapResult::Not {
                inner: Box::new(inner),
                universe,
            },
        }
    }

    /// Checks if the result is the empty sentinel.
    #[must_use]
    pub fn is_empty_sentinel(&self) -> bool {
        matches!(self, BitmapResult::Empty)
    }

    fn exponent(&self) -> Option<u32> {
        match self {
            BitmapResult::Empty => None,
            BitmapResult::Bitmap(bits) => Some(bits.exponent()),
            BitmapResult::And(children) | BitmapResult::Or(children) => {
                children.iter().find_map(BitmapResult::exponent)
            }
            BitmapResult::Not { universe, .. } => Some(universe.exponent()),
        }
    }

    /// Words per block, or 0 for the empty result.
    #[must_use]
    pub fn block_words(&self) -> usize {
        self.exponent().map_or(0, |e| 1 << e)
    }

    /// Upper bound of blocks that can hold a match.
    #[must_use]
    pub fn block_count(&self) -> usize {
        match self {
            BitmapResult::Empty => 0,
            BitmapResult::Bitmap(bits) => bits.block_count(),
            BitmapResult::And(children) => children
                .iter()
                .map(BitmapResult::block_count)
                .min()
                .unwrap_or(0),
            BitmapResult::Or(children) => children
                .iter()
                .map(BitmapResult::block_count)
                .max()
                .unwrap_or(0),
            BitmapResult::Not { universe, .. } => universe.block_count(),
        }
    }

    /// Cheap structural test: `false` means the block holds no match.
    #[must_use]
    pub fn may_contain_block(&self, block: usize) -> bool {
        match self {
            BitmapResult::Empty => false,
            BitmapResult::Bitmap(bits) => bits.has_block(block),
            BitmapResult::And(children) => children.iter().all(|c| c.may_contain_block(block)),
            BitmapResult::Or(children) => children.iter().any(|c| c.may_contain_block(block)),
            BitmapResult::Not { universe, .. } => universe.has_block(block),
        }
    }

    /// Whether AND may skip a block on structure alone.
    ///
    /// Negations are only bounded by the live IDs, so an AND containing one
    /// has to evaluate its children's words instead.
    #[must_use]
    pub fn is_and_logic_optimizable(&self) -> bool {
        match self {
            BitmapResult::Empty | BitmapResult::Bitmap(_) => true,
            BitmapResult::And(children) | BitmapResult::Or(children) => {
                children.iter().all(BitmapResult::is_and_logic_optimizable)
            }
            BitmapResult::Not { .. } => false,
        }
    }

    /// Writes the matching words of one block into `out`.
    ///
    /// Returns whether any word is non-zero; `out` is all zeros otherwise.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn fill_block(&self, block: usize, out: &mut [u64]) -> CoreResult<bool> {
        match self {
            BitmapResult::Empty => {
                out.fill(0);
                Ok(false)
            }
            BitmapResult::Bitmap(bits) => bits.load_block(block, out),
            BitmapResult::And(children) => {
                let Some((first, rest)) = children.split_first() else {
                    out.fill(0);
                    return Ok(false);
                };
                if self.is_and_logic_optimizable() && !self.may_contain_block(block) {
                    out.fill(0);
                    return Ok(false);
                }
                if !first.fill_block(block, out)? {
                    return Ok(false);
                }
                let mut scratch = vec![0u64; out.len()];
                for child in rest {
                    if !child.fill_block(block, &mut scratch)? {
                        out.fill(0);
                        return Ok(false);
                    }
                    let mut any = false;
                    for (word, other) in out.iter_mut().zip(&scratch) {
                        *word &= *other;
                        any |= *word != 0;
                    }
                    if !any {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            BitmapResult::Or(children) => {
                out.fill(0);
                let mut any = false;
                let mut scratch = vec![0u64; out.len()];
                for child in children.iter().filter(|c| c.may_contain_block(block)) {
                    if child.fill_block(block, &mut scratch)? {
                        for (word, other) in out.iter_mut().zip(&scratch) {
                            *word |= *other;
                        }
                        any = true;
                    }
                }
                Ok(any)
            }
            BitmapResult::Not { inner, universe } => {
                if !universe.load_block(block, out)? {
                    return Ok(false);
                }
                let mut scratch = vec![0u64; out.len()];
                if inner.fill_block(block, &mut scratch)? {
                    for (word, other) in out.iter_mut().zip(&scratch) {
                        *word &= !*other;
                    }
                }
                Ok(out.iter().any(|w| *w != 0))
            }
        }
    }

    /// Reads one word of the result.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn word(&self, word_index: u64) -> CoreResult<u64> {
        let Some(exponent) = self.exponent() else {
            return Ok(0);
        };
        let block = (word_index >> exponent) as usize;
        let mut words = vec![0u64; 1 << exponent];
        if !self.may_contain_block(block) || !self.fill_block(block, &mut words)? {
            return Ok(0);
        }
        Ok(words[(word_index & ((1u64 << exponent) - 1)) as usize])
    }

    /// Tests one entity ID.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn contains(&self, id: EntityId) -> CoreResult<bool> {
        let word = self.word(id.as_u64() >> WORD_BITS_EXPONENT)?;
        Ok(word & (1u64 << (id.as_u64() & 63)) != 0)
    }

    /// Number of matching IDs.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn count(&self) -> CoreResult<u64> {
        let mut words = vec![0u64; self.block_words()];
        let mut total = 0;
        for block in 0..self.block_count() {
            if self.may_contain_block(block) && self.fill_block(block, &mut words)? {
                total += words.iter().map(|w| u64::from(w.count_ones())).sum::<u64>();
            }
        }
        Ok(total)
    }

    /// Iterates matching IDs in ascending order.
    #[must_use]
    pub fn cursor(&self) -> BitmapCursor<'_, 'a> {
        self.cursor_range(0, self.block_count())
    }

    /// Iterates matching IDs of the blocks in `start_block..end_block`.
    #[must_use]
    pub fn cursor_range(&self, start_block: usize, end_block: usize) -> BitmapCursor<'_, 'a> {
        let exponent = self.exponent().unwrap_or(0);
        BitmapCursor {
            result: self,
            words: vec![0u64; self.block_words()],
            exponent,
            block: start_block,
            end_block: end_block.min(self.block_count()),
            word_index: 0,
            current: 0,
            base: 0,
            loaded: false,
        }
    }
}

/// Walks a [`BitmapResult`] block by block, word by word.
///
/// Holds one decoded block at a time.
#[derive(Debug)]
pub struct BitmapCursor<'r, 'a> {
    result: &'r BitmapResult<'a>,
    words: Vec<u64>,
    exponent: u32,
    block: usize,
    end_block: usize,
    word_index: usize,
    current: u64,
    base: u64,
    loaded: bool,
}

impl BitmapCursor<'_, '_> {
    fn block_base(&self) -> u64 {
        (self.block as u64) << (self.exponent + WORD_BITS_EXPONENT)
    }

    fn load_next_block(&mut self) -> CoreResult<bool> {
        while self.block < self.end_block {
            if self.result.may_contain_block(self.block)
                && self.result.fill_block(self.block, &mut self.words)?
            {
                self.loaded = true;
                self.word_index = 0;
                self.current = self.words[0];
                self.base = self.block_base();
                return Ok(true);
            }
            self.block += 1;
        }
        Ok(false)
    }
}

impl Iterator for BitmapCursor<'_, '_> {
    type Item = CoreResult<EntityId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = u64::from(self.current.trailing_zeros());
                self.current &= self.current - 1;
                return Some(Ok(EntityId::new(self.base + bit)));
            }

            if self.loaded {
                self.word_index += 1;
                if self.word_index < self.words.len() {
                    self.current = self.words[self.word_index];
                    self.base = self.block_base() + ((self.word_index as u64) << WORD_BITS_EXPONENT);
                    continue;
                }
                self.loaded = false;
                self.block += 1;
            }

            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.block = self.end_block;
                    return Some(Err(err));
                }
            }
        }
    }
}
