// Process-local shelf registry
//
// Within one process a shelf must be mapped at exactly one address, no matter
// how many heaps or regions use it. The registry is a single map keyed by
// shelf id carrying (base, length, refcount, poison flag); the reverse
// address-to-shelf lookup is a scan, which is fine because the table is
// bounded by max-pools times max-shelves-per-pool.
//
// One mutex guards everything. Operations are short and uncontended, so
// finer-grained locking would buy nothing.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

use crate::error::{MmError, Result};
use crate::shelf_id::ShelfId;
use crate::shelf_mgmt::shelf_file::ShelfFile;

struct Entry {
    base: usize,
    length: usize,
    refcount: usize,
    invalid: bool,
}

pub struct ShelfManager {
    map: Mutex<HashMap<ShelfId, Entry>>,
}

static GLOBAL: Lazy<ShelfManager> = Lazy::new(ShelfManager::new);

impl ShelfManager {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry that ShelfFile mappings go through.
    pub fn global() -> &'static ShelfManager {
        &GLOBAL
    }

    /// Records a mapping. If the shelf is already registered the existing
    /// base is returned (the lengths must agree) and the caller should drop
    /// its own mapping.
    pub fn register_shelf(&self, shelf_id: ShelfId, base: *mut u8, length: usize) -> *mut u8 {
        let mut map = self.map.lock();
        match map.get(&shelf_id) {
            Some(entry) => {
                trace!(%shelf_id, "register: existing mapping");
                debug_assert_eq!(entry.length, length);
                entry.base as *mut u8
            }
            None => {
                trace!(%shelf_id, ?base, length, "register: new mapping");
                map.insert(
                    shelf_id,
                    Entry {
                        base: base as usize,
                        length,
                        refcount: 1,
                        invalid: false,
                    },
                );
                base
            }
        }
    }

    /// Removes the entry outright regardless of refcount; returns the range
    /// the caller must now unmap.
    pub fn unregister_shelf(&self, shelf_id: ShelfId) -> Option<(usize, usize)> {
        let mut map = self.map.lock();
        map.remove(&shelf_id).map(|entry| (entry.base, entry.length))
    }

    /// Non-mutating lookup.
    pub fn lookup_shelf(&self, shelf_id: ShelfId) -> Option<*mut u8> {
        let map = self.map.lock();
        map.get(&shelf_id).map(|entry| entry.base as *mut u8)
    }

    /// Bumps the refcount of an existing mapping and returns its base.
    pub fn find_and_open_shelf(&self, shelf_id: ShelfId) -> Option<*mut u8> {
        let mut map = self.map.lock();
        map.get_mut(&shelf_id).map(|entry| {
            entry.refcount += 1;
            entry.base as *mut u8
        })
    }

    /// Drops one reference; returns the base while other users remain, or
    /// `None` on underflow or when the shelf was never registered.
    pub fn find_and_close_shelf(&self, shelf_id: ShelfId) -> Option<*mut u8> {
        let mut map = self.map.lock();
        let entry = map.get_mut(&shelf_id)?;
        if entry.refcount == 0 {
            return None;
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            None
        } else {
            Some(entry.base as *mut u8)
        }
    }

    /// Atomically: find-and-open, or establish a new mapping with `map_fn`
    /// and register it with refcount 1. The registry lock is held across
    /// `map_fn` so two threads cannot double-map one shelf.
    pub fn open_or_register<F>(&self, shelf_id: ShelfId, length: usize, map_fn: F) -> Result<*mut u8>
    where
        F: FnOnce() -> Result<*mut u8>,
    {
        let mut map = self.map.lock();
        if let Some(entry) = map.get_mut(&shelf_id) {
            entry.refcount += 1;
            return Ok(entry.base as *mut u8);
        }
        let base = map_fn()?;
        map.insert(
            shelf_id,
            Entry {
                base: base as usize,
                length,
                refcount: 1,
                invalid: false,
            },
        );
        Ok(base)
    }

    /// Drops one reference; when the last user leaves the entry is removed
    /// and the range to unmap is returned.
    pub fn close_shelf(&self, shelf_id: ShelfId) -> Option<(usize, usize)> {
        let mut map = self.map.lock();
        let entry = map.get_mut(&shelf_id)?;
        if entry.refcount > 0 {
            entry.refcount -= 1;
        }
        if entry.refcount == 0 {
            map.remove(&shelf_id).map(|entry| (entry.base, entry.length))
        } else {
            None
        }
    }

    /// Base address of a registered shelf, without touching the refcount.
    pub fn find_base(&self, shelf_id: ShelfId) -> Option<*mut u8> {
        self.lookup_shelf(shelf_id)
    }

    /// Base address, establishing the mapping on demand from `path` if the
    /// shelf is not registered yet.
    pub fn find_base_or_map(&self, path: &std::path::Path, shelf_id: ShelfId) -> Option<*mut u8> {
        if let Some(base) = self.lookup_shelf(shelf_id) {
            return Some(base);
        }
        let mut shelf = ShelfFile::with_id(path, shelf_id);
        shelf.open(libc::O_RDWR).ok()?;
        let base = shelf.map_registered().ok();
        let _ = shelf.close();
        base
    }

    /// Reverse lookup: which registered shelf contains `ptr`?
    pub fn find_shelf(&self, ptr: *const u8) -> Option<(ShelfId, *mut u8)> {
        let map = self.map.lock();
        let addr = ptr as usize;
        for (shelf_id, entry) in map.iter() {
            if addr >= entry.base && addr < entry.base + entry.length {
                return Some((*shelf_id, entry.base as *mut u8));
            }
        }
        None
    }

    /// Sets the poison bit read back by `ShelfFile::is_invalid`.
    pub fn mark_invalid(&self, shelf_id: ShelfId) -> Result<()> {
        let mut map = self.map.lock();
        match map.get_mut(&shelf_id) {
            Some(entry) => {
                entry.invalid = true;
                Ok(())
            }
            None => Err(MmError::ShelfFileNotFound(shelf_id.to_string())),
        }
    }

    pub fn is_invalid(&self, shelf_id: ShelfId) -> bool {
        let map = self.map.lock();
        map.get(&shelf_id).map(|entry| entry.invalid).unwrap_or(false)
    }

    /// Unmaps every registered shelf. Used when the process configuration
    /// changes or the manager shuts down.
    pub fn reset(&self) {
        let mut map = self.map.lock();
        for (shelf_id, entry) in map.drain() {
            trace!(%shelf_id, "reset: dropping mapping");
            let _ = ShelfFile::unmap_raw(
                entry.base as *mut u8,
                entry.length as u64,
                true,
                crate::config::device_page_size(),
            );
        }
    }
}

impl Default for ShelfManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a fake base address is fine: the registry never dereferences it
    fn fake_base(n: usize) -> *mut u8 {
        n as *mut u8
    }

    #[test]
    fn test_register_returns_existing() {
        let mgr = ShelfManager::new();
        let id = ShelfId::new(1, 2);
        assert_eq!(mgr.register_shelf(id, fake_base(0x1000), 4096), fake_base(0x1000));
        // second registration yields the first base
        assert_eq!(mgr.register_shelf(id, fake_base(0x9000), 4096), fake_base(0x1000));
        assert_eq!(mgr.unregister_shelf(id), Some((0x1000, 4096)));
        assert_eq!(mgr.lookup_shelf(id), None);
    }

    #[test]
    fn test_refcounting() {
        let mgr = ShelfManager::new();
        let id = ShelfId::new(1, 3);
        mgr.register_shelf(id, fake_base(0x2000), 4096);
        assert_eq!(mgr.find_and_open_shelf(id), Some(fake_base(0x2000)));
        // two users now; first close keeps the mapping
        assert_eq!(mgr.find_and_close_shelf(id), Some(fake_base(0x2000)));
        // last close reports underflow-to-zero with None
        assert_eq!(mgr.find_and_close_shelf(id), None);
    }

    #[test]
    fn test_close_shelf_removes_on_last_user() {
        let mgr = ShelfManager::new();
        let id = ShelfId::new(2, 0);
        mgr.register_shelf(id, fake_base(0x3000), 8192);
        mgr.find_and_open_shelf(id);
        assert_eq!(mgr.close_shelf(id), None);
        assert_eq!(mgr.close_shelf(id), Some((0x3000, 8192)));
        assert_eq!(mgr.lookup_shelf(id), None);
    }

    #[test]
    fn test_reverse_lookup() {
        let mgr = ShelfManager::new();
        let id = ShelfId::new(4, 1);
        mgr.register_shelf(id, fake_base(0x10000), 4096);
        assert_eq!(
            mgr.find_shelf(fake_base(0x10800)),
            Some((id, fake_base(0x10000)))
        );
        assert_eq!(mgr.find_shelf(fake_base(0x20000)), None);
    }

    #[test]
    fn test_poison_flag() {
        let mgr = ShelfManager::new();
        let id = ShelfId::new(5, 5);
        assert!(mgr.mark_invalid(id).is_err());
        mgr.register_shelf(id, fake_base(0x4000), 4096);
        assert!(!mgr.is_invalid(id));
        mgr.mark_invalid(id).unwrap();
        assert!(mgr.is_invalid(id));
    }
}
