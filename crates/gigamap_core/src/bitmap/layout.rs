//! Binary layout of bitmap Level2 segments.
//!
//! ```text
//! offset  size  field
//! 0       2     magic "GB"
//! 2       1     format version (1)
//! 3       1     layout: 0 = dense, 1 = sparse
//! 4       1     block exponent (log2 of words per segment)
//! 5       3     reserved, zero
//! 8       4     populated word count (u32 LE)
//! 12      ..    dense:  2^exp words, u64 LE each
//!               sparse: populated word indices (u16 LE, strictly increasing),
//!                       then populated words (u64 LE, all non-zero)
//! end-4   4     CRC-32 over everything before it
//! ```

use crate::error::{CoreError, CoreResult};

const MAGIC: [u8; 2] = *b"GB";
const VERSION: u8 = 1;
pub(crate) const HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// Encoding of the word area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockLayout {
    /// Every word is stored, zero words included.
    Dense = 0,
    /// Only non-zero words are stored, with their indices.
    Sparse = 1,
}

impl TryFrom<u8> for BlockLayout {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlockLayout::Dense),
            1 => Ok(BlockLayout::Sparse),
            _ => Err(CoreError::segment_corruption(format!(
                "unknown bitmap block layout: {}",
                value
            ))),
        }
    }
}

/// Computes a CRC-32 (IEEE) checksum.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Size in bytes of a block encoded with the given layout.
pub(crate) fn encoded_size(layout: BlockLayout, words: usize, populated: usize) -> usize {
    let body = match layout {
        BlockLayout::Dense => words * 8,
        BlockLayout::Sparse => populated * 10,
    };
    HEADER_SIZE + body + CRC_SIZE
}

/// Picks the smaller layout for a block.
pub(crate) fn preferred_layout(words: usize, populated: usize) -> BlockLayout {
    if encoded_size(BlockLayout::Sparse, words, populated)
        < encoded_size(BlockLayout::Dense, words, populated)
    {
        BlockLayout::Sparse
    } else {
        BlockLayout::Dense
    }
}

/// Encodes a block of words.
pub(crate) fn encode(words: &[u64], block_exponent: u32, layout: BlockLayout) -> Vec<u8> {
    let populated = words.iter().filter(|w| **w != 0).count();
    let mut buf = Vec::with_capacity(encoded_size(layout, words.len(), populated));

    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(layout as u8);
    buf.push(block_exponent as u8);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&(populated as u32).to_le_bytes());

    match layout {
        BlockLayout::Dense => {
            for word in words {
                buf.extend_from_slice(&word.to_le_bytes());
            }
        }
        BlockLayout::Sparse => {
            for (index, _) in words.iter().enumerate().filter(|(_, w)| **w != 0) {
                buf.extend_from_slice(&(index as u16).to_le_bytes());
            }
            for word in words.iter().filter(|w| **w != 0) {
                buf.extend_from_slice(&word.to_le_bytes());
            }
        }
    }

    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Header fields of a validated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub layout: BlockLayout,
    pub populated: usize,
}

/// Reads the header of an encoded block without validating the body.
///
/// Only called on bytes that already passed [`validate`].
pub(crate) fn header(bytes: &[u8]) -> BlockHeader {
    let layout = if bytes[3] == BlockLayout::Sparse as u8 {
        BlockLayout::Sparse
    } else {
        BlockLayout::Dense
    };
    BlockHeader {
        layout,
        populated: read_u32(bytes, 8) as usize,
    }
}

/// Checks every structural property of an encoded block.
///
/// A block that fails here must never be interpreted: a misread bit layout
/// would silently corrupt unrelated query results.
pub(crate) fn validate(bytes: &[u8], block_exponent: u32) -> CoreResult<BlockHeader> {
    let words = 1usize << block_exponent;

    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(CoreError::segment_corruption(format!(
            "bitmap block too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0..2] != MAGIC {
        return Err(CoreError::segment_corruption("bitmap block magic mismatch"));
    }
    if bytes[2] != VERSION {
        return Err(CoreError::segment_corruption(format!(
            "unsupported bitmap block version: {}",
            bytes[2]
        )));
    }
    let layout = BlockLayout::try_from(bytes[3])?;
    if u32::from(bytes[4]) != block_exponent {
        return Err(CoreError::segment_corruption(format!(
            "bitmap block exponent {} does not match configured {}",
            bytes[4], block_exponent
        )));
    }
    if bytes[5..8] != [0, 0, 0] {
        return Err(CoreError::segment_corruption("bitmap block reserved bytes set"));
    }
    let populated = read_u32(bytes, 8) as usize;
    if populated == 0 || populated > words {
        return Err(CoreError::segment_corruption(format!(
            "bitmap block populated count {} outside 1..={}",
            populated, words
        )));
    }
    let expected_len = encoded_size(layout, words, populated);
    if bytes.len() != expected_len {
        return Err(CoreError::segment_corruption(format!(
            "bitmap block length {} does not match layout length {}",
            bytes.len(),
            expected_len
        )));
    }

    let crc_offset = bytes.len() - CRC_SIZE;
    let stored_crc = read_u32(bytes, crc_offset);
    let actual_crc = compute_crc32(&bytes[..crc_offset]);
    if stored_crc != actual_crc {
        return Err(CoreError::segment_corruption(format!(
            "bitmap block checksum mismatch: expected {:08x}, got {:08x}",
            stored_crc, actual_crc
        )));
    }

    match layout {
        BlockLayout::Dense => {
            let non_zero = (0..words)
                .filter(|i| read_u64(bytes, HEADER_SIZE + i * 8) != 0)
                .count();
            if non_zero != populated {
                return Err(CoreError::segment_corruption(format!(
                    "dense bitmap block declares {} populated words, holds {}",
                    populated, non_zero
                )));
            }
        }
        BlockLayout::Sparse => {
            let mut previous: Option<usize> = None;
            for slot in 0..populated {
                let index = sparse_index(bytes, slot);
                if index >= words || previous.is_some_and(|p| index <= p) {
                    return Err(CoreError::segment_corruption(format!(
                        "sparse bitmap block index {} out of order or range",
                        index
                    )));
                }
                if sparse_word(bytes, populated, slot) == 0 {
                    return Err(CoreError::segment_corruption(
                        "sparse bitmap block stores a zero word",
                    ));
                }
                previous = Some(index);
            }
        }
    }

    Ok(BlockHeader { layout, populated })
}

/// Reads one word from a validated encoded block.
pub(crate) fn read_word(bytes: &[u8], word_index: usize) -> u64 {
    let BlockHeader { layout, populated } = header(bytes);
    match layout {
        BlockLayout::Dense => read_u64(bytes, HEADER_SIZE + word_index * 8),
        BlockLayout::Sparse => {
            let (mut low, mut high) = (0usize, populated);
            while low < high {
                let mid = (low + high) / 2;
                let index = sparse_index(bytes, mid);
                if index == word_index {
                    return sparse_word(bytes, populated, mid);
                }
                if index < word_index {
                    low = mid + 1;
                } else {
                    high = mid;
                }
            }
            0
        }
    }
}

/// Decodes a validated block into `out`, which holds one slot per word.
pub(crate) fn decode_into(bytes: &[u8], out: &mut [u64]) {
    let BlockHeader { layout, populated } = header(bytes);
    match layout {
        BlockLayout::Dense => {
            for (i, word) in out.iter_mut().enumerate() {
                *word = read_u64(bytes, HEADER_SIZE + i * 8);
            }
        }
        BlockLayout::Sparse => {
            out.fill(0);
            for slot in 0..populated {
                out[sparse_index(bytes, slot)] = sparse_word(bytes, populated, slot);
            }
        }
    }
}

fn sparse_index(bytes: &[u8], slot: usize) -> usize {
    let offset = HEADER_SIZE + slot * 2;
    usize::from(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
}

fn sparse_word(bytes: &[u8], populated: usize, slot: usize) -> u64 {
    read_u64(bytes, HEADER_SIZE + populated * 2 + slot * 8)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
