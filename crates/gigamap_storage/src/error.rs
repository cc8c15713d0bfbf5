//! Error types for segment store operations.

use crate::store::SegmentHandle;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No bytes were ever written under the handle, or they were removed.
    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentHandle),

    /// The store file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
