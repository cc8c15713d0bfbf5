//! # GigaMap Core
//!
//! An embedded, indexed collection for very large entity counts.
//!
//! This crate provides:
//! - A sharded entity store addressed by sequential 64-bit IDs
//! - Compressed bitmap indices (hashing, binary, composite, boolean)
//! - Unique and custom constraints checked before any change is applied
//! - Condition trees combined with AND, OR and NOT, scanned lazily or in parallel
//! - Change tracking and an evict/reload cycle against a segment store
//!
//! ## Example
//!
//! ```rust
//! use gigamap_core::{BinaryFn, BooleanFn, GigaMap};
//!
//! struct Order {
//!     customer: u32,
//!     shipped: bool,
//! }
//!
//! let map = GigaMap::new();
//! let customer = map
//!     .add_binary_index(BinaryFn::new("customer", |o: &Order| Some(o.customer)))
//!     .unwrap();
//! let shipped = map
//!     .add_boolean_index(BooleanFn::new("shipped", |o: &Order| o.shipped))
//!     .unwrap();
//! map.add_unique_constraint(&customer).unwrap();
//!
//! map.add(Order { customer: 7, shipped: false }).unwrap();
//! map.add(Order { customer: 9, shipped: true }).unwrap();
//! assert!(map.add(Order { customer: 7, shipped: true }).is_err());
//!
//! let pending = map.query(customer.in_set([7, 9]) & shipped.is_false());
//! assert_eq!(pending.count().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bitmap;
mod config;
mod constraint;
mod entity;
mod error;
mod index;
mod lazy;
mod map;
mod persistence;
mod query;
mod state;
mod stats;
mod types;

pub use bitmap::{BitmapCursor, BitmapEntry, BitmapLevel2, BitmapLevel3, BitmapResult};
pub use config::GigaMapConfig;
pub use constraint::{ConstraintFn, CustomConstraint, CustomConstraints, UniqueConstraints};
pub use entity::{CborCodec, EntityAddress, EntityCodec, EntityId, EntityStore};
pub use error::{AnyEntity, CoreError, CoreResult};
pub use index::{
    BinaryFn, BinaryIndex, BinaryIndexer, BinaryValue, BooleanFn, BooleanIndex, BooleanIndexer,
    CompositeIndex, CompositeIndexer, EntryHandle, HashingFn, HashingIndex, HashingIndexer,
    IndexHandle, IndexKind, IndexMaintainer, IndexRegistry, SubKind, Transition,
};
pub use lazy::{Lazy, SegmentLoader, UsageMarker};
pub use map::{GigaMap, MapReader, Query};
pub use persistence::StoreReport;
pub use query::{
    partition, scan, Condition, ConditionLeaf, IterationThreadProvider, QueryContext, Task,
    ThreadCountStrategy, ThreadPool,
};
pub use state::{ChangeSet, NodeId, StateFlags};
pub use stats::{GigaMapStats, StatsSnapshot};
pub use types::{BitmapOwner, IndexId};

pub use gigamap_storage::{
    FileSegmentStore, InMemorySegmentStore, SegmentHandle, SegmentStore, StorageError,
};
