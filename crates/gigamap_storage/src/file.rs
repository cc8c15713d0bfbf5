//! File-based segment store for persistent storage.

use crate::error::{StorageError, StorageResult};
use crate::store::{SegmentHandle, SegmentStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Frame header: handle (8) + payload length (4).
const FRAME_HEADER_SIZE: u64 = 12;

/// Payload length marking a removal frame.
const REMOVED: u32 = u32::MAX;

/// A file-based segment store.
///
/// Every write appends a frame `[handle u64][len u32][bytes]` to one file;
/// the latest frame for a handle wins. The handle table is rebuilt by
/// scanning the frames on open.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` followed by `File::sync_data()`
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
/// Internal locking ensures consistent access.
///
/// # Example
///
/// ```no_run
/// use gigamap_storage::{FileSegmentStore, SegmentStore};
/// use std::path::Path;
///
/// let store = FileSegmentStore::open(Path::new("segments.dat")).unwrap();
/// let handle = store.allocate();
/// store.write(handle, b"persistent segment").unwrap();
/// store.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileSegmentStore {
    path: PathBuf,
    file: RwLock<File>,
    /// handle -> (payload offset, payload length)
    table: RwLock<HashMap<SegmentHandle, (u64, u32)>>,
    size: RwLock<u64>,
    next_handle: AtomicU64,
}

impl FileSegmentStore {
    /// Opens or creates a segment store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its frames are damaged.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();
        let (table, max_handle) = Self::scan_frames(&mut file, size)?;

        tracing::debug!(
            path = %path.display(),
            segments = table.len(),
            "opened file segment store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            table: RwLock::new(table),
            size: RwLock::new(size),
            next_handle: AtomicU64::new(max_handle + 1),
        })
    }

    /// Opens or creates a segment store, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan_frames(
        file: &mut File,
        size: u64,
    ) -> StorageResult<(HashMap<SegmentHandle, (u64, u32)>, u64)> {
        let mut table = HashMap::new();
        let mut max_handle = 0u64;
        let mut offset = 0u64;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];

        file.seek(SeekFrom::Start(0))?;
        while offset < size {
            if offset + FRAME_HEADER_SIZE > size {
                return Err(StorageError::Corrupted(format!(
                    "truncated frame header at offset {offset}"
                )));
            }
            file.read_exact(&mut header)?;
            let raw = u64::from_le_bytes([
                header[0], header[1], header[2], header[3], header[4], header[5], header[6],
                header[7],
            ]);
            let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let handle = SegmentHandle::new(raw).ok_or_else(|| {
                StorageError::Corrupted(format!("zero handle in frame at offset {offset}"))
            })?;
            max_handle = max_handle.max(raw);

            let payload_offset = offset + FRAME_HEADER_SIZE;
            if len == REMOVED {
                table.remove(&handle);
                offset = payload_offset;
                continue;
            }
            if payload_offset + u64::from(len) > size {
                return Err(StorageError::Corrupted(format!(
                    "frame for {handle} extends past end of file"
                )));
            }
            table.insert(handle, (payload_offset, len));
            offset = payload_offset + u64::from(len);
            file.seek(SeekFrom::Start(offset))?;
        }

        Ok((table, max_handle))
    }

    fn append_frame(&self, handle: SegmentHandle, len: u32, payload: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        let frame_offset = *size;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&handle.as_u64().to_le_bytes())?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(payload)?;
        *size += FRAME_HEADER_SIZE + payload.len() as u64;

        Ok(frame_offset + FRAME_HEADER_SIZE)
    }
}

impl SegmentStore for FileSegmentStore {
    fn allocate(&self) -> SegmentHandle {
        SegmentHandle::allocated(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn write(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()> {
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| *len != REMOVED)
            .ok_or_else(|| {
                StorageError::Corrupted(format!(
                    "segment {handle} too large: {} bytes",
                    bytes.len()
                ))
            })?;
        let payload_offset = self.append_frame(handle, len, bytes)?;
        self.table.write().insert(handle, (payload_offset, len));
        Ok(())
    }

    fn read(&self, handle: SegmentHandle) -> StorageResult<Vec<u8>> {
        let (offset, len) = self
            .table
            .read()
            .get(&handle)
            .copied()
            .ok_or(StorageError::SegmentNotFound(handle))?;

        let mut buffer = vec![0u8; len as usize];
        if len > 0 {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn remove(&self, handle: SegmentHandle) -> StorageResult<()> {
        if self.table.write().remove(&handle).is_some() {
            self.append_frame(handle, REMOVED, &[])?;
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.table.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FileSegmentStore) {
        let dir = TempDir::new().unwrap();
        let store = FileSegmentStore::open(&dir.path().join("segments.dat")).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read() {
        let (_dir, store) = temp_store();
        let handle = store.allocate();
        store.write(handle, b"hello world").unwrap();
        assert_eq!(store.read(handle).unwrap(), b"hello world");
    }

    #[test]
    fn latest_write_wins() {
        let (_dir, store) = temp_store();
        let handle = store.allocate();
        store.write(handle, b"old").unwrap();
        store.write(handle, b"newer bytes").unwrap();
        assert_eq!(store.read(handle).unwrap(), b"newer bytes");
        assert_eq!(store.segment_count(), 1);
    }

    #[test]
    fn empty_segment_roundtrips() {
        let (_dir, store) = temp_store();
        let handle = store.allocate();
        store.write(handle, &[]).unwrap();
        assert!(store.read(handle).unwrap().is_empty());
    }

    #[test]
    fn reopen_restores_table_and_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments.dat");

        let (kept, removed) = {
            let store = FileSegmentStore::open(&path).unwrap();
            let kept = store.allocate();
            let removed = store.allocate();
            store.write(kept, b"kept").unwrap();
            store.write(removed, b"removed").unwrap();
            store.remove(removed).unwrap();
            store.flush().unwrap();
            (kept, removed)
        };

        let store = FileSegmentStore::open(&path).unwrap();
        assert_eq!(store.read(kept).unwrap(), b"kept");
        assert!(matches!(
            store.read(removed),
            Err(StorageError::SegmentNotFound(_))
        ));
        assert!(store.allocate() > removed);
    }

    #[test]
    fn truncated_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments.dat");
        {
            let store = FileSegmentStore::open(&path).unwrap();
            let handle = store.allocate();
            store.write(handle, b"0123456789").unwrap();
            store.flush().unwrap();
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(15).unwrap();
        drop(file);

        let result = FileSegmentStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }
}
