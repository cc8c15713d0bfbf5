//! The bitmap bit-store.
//!
//! Each index key owns a [`BitmapEntry`], whose bits live in a
//! [`BitmapLevel3`] table of lazily loaded [`BitmapLevel2`] blocks. Blocks
//! switch between a dense working form and a compressed storage form; see
//! [`layout`] for the byte format.

pub mod layout;
mod entry;
mod level2;
mod level3;
mod result;

pub use entry::BitmapEntry;
pub use level2::BitmapLevel2;
pub use level3::BitmapLevel3;
pub use result::{BitmapCursor, BitmapResult};
