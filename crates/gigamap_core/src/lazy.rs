//! Lazily loaded, evictable segment references.
//!
//! A [`Lazy`] is either resident (holds its value) or evicted (holds the
//! loader that can bring the value back from a segment store). Eviction is
//! only permitted while no [`UsageMarker`] pins the reference.

use crate::error::{CoreError, CoreResult};
use gigamap_storage::SegmentHandle;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Loads a segment value back from storage.
pub trait SegmentLoader<T>: Send + Sync {
    /// Loads and validates the segment stored under `handle`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the bytes cannot be read, or
    /// [`CoreError::SegmentCorruption`] if they fail the layout check.
    fn load(&self, handle: SegmentHandle) -> CoreResult<T>;
}

/// Pins a lazy reference against eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageMarker(u64);

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

impl UsageMarker {
    /// Held by segments with changes that have not been stored yet.
    pub const DIRTY: Self = Self(0);

    /// Returns a marker no other caller holds.
    #[must_use]
    pub fn unique() -> Self {
        Self(NEXT_MARKER.fetch_add(1, Ordering::Relaxed))
    }
}

enum Slot<T> {
    Resident(T),
    Evicted(Arc<dyn SegmentLoader<T>>),
}

/// A segment reference that may be evicted and reloaded transparently.
pub struct Lazy<T> {
    slot: RwLock<Slot<T>>,
    handle: Option<SegmentHandle>,
    pins: Mutex<Vec<UsageMarker>>,
}

impl<T> Lazy<T> {
    /// Creates a resident reference that has never been stored.
    pub fn new(value: T) -> Self {
        Self {
            slot: RwLock::new(Slot::Resident(value)),
            handle: None,
            pins: Mutex::new(Vec::new()),
        }
    }

    /// Creates an evicted reference to a stored segment.
    pub fn evicted(handle: SegmentHandle, loader: Arc<dyn SegmentLoader<T>>) -> Self {
        Self {
            slot: RwLock::new(Slot::Evicted(loader)),
            handle: Some(handle),
            pins: Mutex::new(Vec::new()),
        }
    }

    /// Returns the value, loading it first if it was evicted.
    ///
    /// # Errors
    ///
    /// Propagates loader errors; the reference stays evicted in that case.
    pub fn get(&self) -> CoreResult<MappedRwLockReadGuard<'_, T>> {
        match RwLockReadGuard::try_map(self.slot.read(), Self::resident) {
            Ok(value) => return Ok(value),
            Err(guard) => drop(guard),
        }

        let mut guard = self.slot.write();
        self.load_into(&mut guard)?;
        RwLockReadGuard::try_map(RwLockWriteGuard::downgrade(guard), Self::resident)
            .map_err(|_| CoreError::segment_corruption("segment evicted while loading"))
    }

    /// Returns the value mutably, loading it first if it was evicted.
    ///
    /// # Errors
    ///
    /// Propagates loader errors.
    pub fn get_mut(&mut self) -> CoreResult<&mut T> {
        let handle = self.handle;
        let slot = self.slot.get_mut();
        if let Slot::Evicted(loader) = slot {
            let handle = handle.ok_or_else(|| {
                CoreError::segment_corruption("evicted segment has no storage handle")
            })?;
            *slot = Slot::Resident(loader.load(handle)?);
        }
        match slot {
            Slot::Resident(value) => Ok(value),
            Slot::Evicted(_) => Err(CoreError::segment_corruption(
                "segment evicted while loading",
            )),
        }
    }

    /// Returns the value only if it is resident. Never triggers a load.
    pub fn peek(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.slot.read(), Self::resident).ok()
    }

    /// Whether the value is currently in memory.
    pub fn is_resident(&self) -> bool {
        matches!(*self.slot.read(), Slot::Resident(_))
    }

    /// The storage handle, once the segment has been stored.
    pub fn handle(&self) -> Option<SegmentHandle> {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: SegmentHandle) {
        self.handle = Some(handle);
    }

    /// Pins the reference for `marker`. Pinning twice with one marker pins once.
    pub fn mark_used_for(&self, marker: UsageMarker) {
        let mut pins = self.pins.lock();
        if !pins.contains(&marker) {
            pins.push(marker);
        }
    }

    /// Releases the pin held by `marker`.
    pub fn unmark_used_for(&self, marker: UsageMarker) {
        self.pins.lock().retain(|pin| *pin != marker);
    }

    /// Whether any marker pins the reference.
    pub fn is_used(&self) -> bool {
        !self.pins.lock().is_empty()
    }

    /// Whether `marker` pins the reference.
    pub fn is_used_by(&self, marker: UsageMarker) -> bool {
        self.pins.lock().contains(&marker)
    }

    /// Drops the resident value in favour of `loader`.
    ///
    /// Only stored, unpinned, resident references are evicted; returns
    /// whether eviction happened.
    pub fn evict(&mut self, loader: Arc<dyn SegmentLoader<T>>) -> bool {
        if self.handle.is_none() || !self.pins.get_mut().is_empty() {
            return false;
        }
        let slot = self.slot.get_mut();
        if matches!(slot, Slot::Evicted(_)) {
            return false;
        }
        *slot = Slot::Evicted(loader);
        true
    }

    fn resident(slot: &Slot<T>) -> Option<&T> {
        match slot {
            Slot::Resident(value) => Some(value),
            Slot::Evicted(_) => None,
        }
    }

    fn load_into(&self, slot: &mut Slot<T>) -> CoreResult<()> {
        if let Slot::Evicted(loader) = slot {
            let handle = self.handle.ok_or_else(|| {
                CoreError::segment_corruption("evicted segment has no storage handle")
            })?;
            let value = loader.load(handle)?;
            tracing::trace!(%handle, "reloaded evicted segment");
            *slot = Slot::Resident(value);
        }
        Ok(())
    }
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("resident", &self.is_resident())
            .field("handle", &self.handle)
            .field("pins", &self.pins.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl SegmentLoader<String> for CountingLoader {
        fn load(&self, handle: SegmentHandle) -> CoreResult<String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::segment_corruption("bad bytes"));
            }
            Ok(format!("loaded {}", handle.as_u64()))
        }
    }

    fn loader(fail: bool) -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail,
        })
    }

    fn handle(raw: u64) -> SegmentHandle {
        SegmentHandle::new(raw).unwrap()
    }

    #[test]
    fn resident_get_does_not_load() {
        let lazy = Lazy::new("value".to_string());
        assert_eq!(&*lazy.get().unwrap(), "value");
        assert!(lazy.is_resident());
    }

    #[test]
    fn evicted_get_loads_once() {
        let counting = loader(false);
        let lazy: Lazy<String> = Lazy::evicted(handle(9), counting.clone());

        assert!(lazy.peek().is_none());
        assert_eq!(&*lazy.get().unwrap(), "loaded 9");
        assert_eq!(&*lazy.get().unwrap(), "loaded 9");
        assert_eq!(counting.loads.load(Ordering::SeqCst), 1);
        assert!(lazy.peek().is_some());
    }

    #[test]
    fn failed_load_stays_evicted() {
        let lazy: Lazy<String> = Lazy::evicted(handle(1), loader(true));
        assert!(matches!(
            lazy.get(),
            Err(CoreError::SegmentCorruption { .. })
        ));
        assert!(!lazy.is_resident());
    }

    #[test]
    fn get_mut_loads() {
        let mut lazy: Lazy<String> = Lazy::evicted(handle(4), loader(false));
        lazy.get_mut().unwrap().push('!');
        assert_eq!(&*lazy.get().unwrap(), "loaded 4!");
    }

    #[test]
    fn unstored_reference_is_not_evicted() {
        let mut lazy = Lazy::new("fresh".to_string());
        assert!(!lazy.evict(loader(false)));
        assert!(lazy.is_resident());
    }

    #[test]
    fn pinned_reference_is_not_evicted() {
        let mut lazy = Lazy::new("pinned".to_string());
        lazy.set_handle(handle(2));
        let marker = UsageMarker::unique();

        lazy.mark_used_for(marker);
        lazy.mark_used_for(marker);
        assert!(!lazy.evict(loader(false)));

        lazy.unmark_used_for(marker);
        assert!(!lazy.is_used());
        assert!(lazy.evict(loader(false)));
        assert!(!lazy.is_resident());
    }

    #[test]
    fn markers_are_distinct() {
        let a = UsageMarker::unique();
        let b = UsageMarker::unique();
        assert_ne!(a, b);
        assert_ne!(a, UsageMarker::DIRTY);
    }
}
