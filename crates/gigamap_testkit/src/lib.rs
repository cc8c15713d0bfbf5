//! # GigaMap Test Kit
//!
//! Test utilities, fixtures and property generators for GigaMap.
//!
//! This crate provides:
//! - A sample [`Person`] entity with one indexer of every kind
//! - Maps and file-backed segment stores with automatic cleanup
//! - Proptest strategies for people, map operations and geometries
//! - An [`IntegrationHarness`] that cross-checks queries against a shadow
//! - Stress runs for large populations and concurrent readers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gigamap_testkit::prelude::*;
//!
//! #[test]
//! fn my_test() {
//!     let map = TestMap::compact();
//!     scenarios::populate(&map, 100);
//!     let moshi = map.query(map.indices.city.is("Moshi".to_string()));
//!     assert!(moshi.count().unwrap() > 0);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber filtered by `RUST_LOG`, defaulting to
/// `warn`. Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
