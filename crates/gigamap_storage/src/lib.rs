//! # GigaMap Storage
//!
//! Segment store abstraction backing GigaMap persistence.
//!
//! A segment store is an **opaque handle → bytes store**. The engine decides
//! what a segment is (an entity slot block, a bitmap block, a handle table);
//! the store only keeps the bytes and hands them back.
//!
//! ## Design Principles
//!
//! - Handles are allocated by the store and never reused
//! - Writing to an existing handle replaces its bytes
//! - No knowledge of GigaMap segment layouts
//! - Must be `Send + Sync`: loaders share one store across threads
//!
//! ## Available Stores
//!
//! - [`InMemorySegmentStore`] - For testing and ephemeral maps
//! - [`FileSegmentStore`] - Append-only file with an in-memory handle table
//!
//! ## Example
//!
//! ```rust
//! use gigamap_storage::{InMemorySegmentStore, SegmentStore};
//!
//! let store = InMemorySegmentStore::new();
//! let handle = store.allocate();
//! store.write(handle, b"segment bytes").unwrap();
//! assert_eq!(store.read(handle).unwrap(), b"segment bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileSegmentStore;
pub use memory::InMemorySegmentStore;
pub use store::{SegmentHandle, SegmentStore};
