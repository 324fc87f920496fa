// Distributed multi-shelf heap
//
// A DistHeap occupies one pool. Shelf 0 is the coordination shelf: an
// Ownership table with one slot per shelf index, followed by FreeLists with
// one queue per shelf index. Shelves 1..N are payload shelves, each carrying
// one ShelfHeap whose allocator state only its owner process writes.
//
// Opening acquires an unclaimed payload shelf (growing the pool when every
// existing shelf is owned by a live peer) and drains the remote frees queued
// for it. Freeing a pointer into someone else's shelf queues it on that
// shelf's free list; the owner folds it in on its next alloc or open. A
// crashed owner is detected through its stale ProcessID and its shelf is
// recovered by whichever process trips over it first.
//
// Handles are not shared across threads; everything cross-process rides on
// the coordination shelf's fabric atomics.

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{MmError, Result};
use crate::global_ptr::GlobalPtr;
use crate::shelf_id::{PoolId, ShelfId, ShelfIndex};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_mgmt::shelf_file::ShelfFile;
use crate::shelf_usage::freelists::FreeLists;
use crate::shelf_usage::ownership::Ownership;
use crate::shelf_usage::shelf_heap::ShelfHeap;

/// Shelf index of the coordination shelf.
const COMM_SHELF_IDX: ShelfIndex = 0;

/// One ownership slot / free list per possible shelf index.
const SLOT_COUNT: u64 = ShelfId::MAX_SHELF_COUNT as u64;

/// Attempts to acquire or grow before open/alloc give up; bounds the race
/// where peers snatch every shelf we add.
const ACQUIRE_RETRIES: usize = 3;

struct Comm {
    file: ShelfFile,
    base: *mut u8,
    ownership: Ownership,
    freelists: FreeLists,
}

// Safety: the comm shelf is only touched through fam atomics.
unsafe impl Send for Comm {}

struct OwnedShelf {
    idx: ShelfIndex,
    heap: ShelfHeap,
}

struct OpenState {
    comm: Comm,
    owned: Vec<OwnedShelf>,
}

pub struct DistHeap {
    pool_id: PoolId,
    pool: Pool,
    state: Option<OpenState>,
}

impl DistHeap {
    pub fn new(config: &Config, pool_id: PoolId) -> Self {
        Self {
            pool_id,
            pool: Pool::new(config, pool_id),
            state: None,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn exist(&self) -> bool {
        self.pool.exist()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Creates the heap pool: the directory, then the coordination shelf.
    /// `shelf_size` is the size of each shelf, not of the whole heap;
    /// `min_alloc_size` zero selects bump shelves, nonzero zone shelves.
    pub fn create(&mut self, shelf_size: u64, min_alloc_size: u64, mode: u32) -> Result<()> {
        if shelf_size == 0 {
            return Err(MmError::InvalidArgument("shelf_size is zero".into()));
        }
        if self.pool.exist() {
            return Err(MmError::PoolFound(self.pool_id));
        }
        self.pool.create(shelf_size, min_alloc_size, mode)?;
        self.pool.open(false)?;
        let mut format =
            |shelf: &mut ShelfFile, size: u64| -> Result<()> { format_comm_shelf(shelf, size) };
        let added = self.pool.add_shelf(COMM_SHELF_IDX, &mut format, false);
        self.pool.close()?;
        if let Err(err) = added {
            let _ = self.pool.destroy();
            return Err(MmError::HeapCreateFailed(err.to_string()));
        }
        info!(pool = self.pool_id, shelf_size, min_alloc_size, "heap created");
        Ok(())
    }

    /// Destroys the pool and every shelf in it. Callers must ensure no other
    /// process still has the heap open.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(MmError::HeapDestroyFailed("heap is open".into()));
        }
        if !self.pool.exist() {
            return Err(MmError::PoolNotFound(self.pool_id));
        }
        self.pool.open(false)?;
        let _ = self.pool.recover();
        let slots = self.pool.size()?;
        for idx in 0..slots as ShelfIndex {
            if self.pool.check_shelf(idx)? {
                if let Err(err) = self.pool.remove_shelf(idx) {
                    let _ = self.pool.close();
                    return Err(MmError::HeapDestroyFailed(err.to_string()));
                }
            }
        }
        self.pool.close()?;
        self.pool
            .destroy()
            .map_err(|err| MmError::HeapDestroyFailed(err.to_string()))?;
        info!(pool = self.pool_id, "heap destroyed");
        Ok(())
    }

    /// Opens the heap: recovers shelves of dead owners, acquires a payload
    /// shelf for this handle, and folds in remote frees queued for it.
    /// Opening an already-open heap is a no-op.
    pub fn open(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        self.pool
            .open(false)
            .map_err(|err| MmError::HeapOpenFailed(err.to_string()))?;

        let comm = match open_comm_shelf(&self.pool) {
            Ok(comm) => comm,
            Err(err) => {
                let _ = self.pool.close();
                return Err(MmError::HeapOpenFailed(err.to_string()));
            }
        };

        // reconcile the directory, then sweep ownership slots of the dead
        let _ = self.pool.recover();
        let min_alloc = self.pool.min_alloc_size().unwrap_or(0);
        let slots = self.pool.size().unwrap_or(0);
        for idx in 1..slots as ShelfIndex {
            if !self.pool.check_shelf(idx).unwrap_or(false) {
                continue;
            }
            let path = self.pool.get_shelf_path(idx);
            let shelf_id = self.pool.shelf_id(idx);
            let ret = comm.ownership.check_and_revoke_with_recover(idx as usize, |i| {
                debug!(pool = self.pool_id, shelf = i, "recovering orphaned shelf heap");
                let mut heap = ShelfHeap::new(&path, shelf_id, min_alloc);
                heap.recover()
            });
            if let Err(err) = ret {
                warn!(pool = self.pool_id, shelf = idx, error = %err, "shelf recovery failed");
            }
        }

        let mut state = OpenState {
            comm,
            owned: Vec::new(),
        };
        match acquire_payload_shelf(&mut self.pool, &mut state) {
            Ok(idx) => {
                drain_remote_frees(self.pool_id, &state, idx);
                self.state = Some(state);
                info!(pool = self.pool_id, shelf = idx, "heap opened");
                Ok(())
            }
            Err(err) => {
                close_comm_shelf(state.comm);
                let _ = self.pool.close();
                Err(err)
            }
        }
    }

    /// Releases every ownership slot this handle holds and drops the
    /// mappings. Closing a closed heap is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut state = match self.state.take() {
            Some(state) => state,
            None => return Ok(()),
        };
        for mut owned in state.owned.drain(..) {
            let _ = owned.heap.close();
            match state.comm.ownership.release_item(owned.idx as usize) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(pool = self.pool_id, shelf = owned.idx, "ownership was revoked while open");
                }
                Err(err) => {
                    warn!(pool = self.pool_id, shelf = owned.idx, error = %err, "release failed");
                }
            }
        }
        close_comm_shelf(state.comm);
        self.pool
            .close()
            .map_err(|err| MmError::HeapCloseFailed(err.to_string()))?;
        info!(pool = self.pool_id, "heap closed");
        Ok(())
    }

    /// Allocates `size` bytes, returning the invalid pointer on exhaustion.
    pub fn alloc(&mut self, size: u64) -> GlobalPtr {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return GlobalPtr::INVALID,
        };

        // fast path: any shelf we already own
        for owned in state.owned.iter() {
            if let Ok(offset) = owned.heap.alloc(size) {
                if offset != 0 {
                    return GlobalPtr::new(ShelfId::new(self.pool_id, owned.idx), offset);
                }
            }
        }

        // fold in remote frees and retry
        let owned_idxs: Vec<ShelfIndex> = state.owned.iter().map(|o| o.idx).collect();
        for idx in owned_idxs {
            drain_remote_frees(self.pool_id, state, idx);
        }
        for owned in state.owned.iter() {
            if let Ok(offset) = owned.heap.alloc(size) {
                if offset != 0 {
                    return GlobalPtr::new(ShelfId::new(self.pool_id, owned.idx), offset);
                }
            }
        }

        // last resort: take over or grow another shelf
        match acquire_payload_shelf(&mut self.pool, state) {
            Ok(idx) => {
                drain_remote_frees(self.pool_id, state, idx);
                let owned = state
                    .owned
                    .iter()
                    .find(|o| o.idx == idx)
                    .expect("just acquired");
                match owned.heap.alloc(size) {
                    Ok(offset) if offset != 0 => {
                        GlobalPtr::new(ShelfId::new(self.pool_id, idx), offset)
                    }
                    _ => GlobalPtr::INVALID,
                }
            }
            Err(err) => {
                debug!(pool = self.pool_id, size, error = %err, "allocation exhausted");
                GlobalPtr::INVALID
            }
        }
    }

    /// Frees a pointer from this pool: locally when we own its shelf,
    /// through the shelf's free list otherwise.
    pub fn free(&mut self, ptr: GlobalPtr) -> Result<()> {
        if !ptr.is_valid() || ptr.shelf_id().pool_id() != self.pool_id {
            return Err(MmError::InvalidPtr(ptr));
        }
        let state = self.state.as_ref().ok_or(MmError::InvalidPtr(ptr))?;
        let idx = ptr.shelf_id().shelf_index();
        if let Some(owned) = state.owned.iter().find(|o| o.idx == idx) {
            owned.heap.free(ptr.offset())?;
            trace!(pool = self.pool_id, %ptr, "freed locally");
        } else {
            state.comm.freelists.put_pointer(idx, ptr)?;
            trace!(pool = self.pool_id, %ptr, "queued for remote free");
        }
        Ok(())
    }

    /// Local address of a pointer into this pool (the owning shelf must be
    /// open in this handle).
    pub fn global_to_local(&self, ptr: GlobalPtr) -> Result<*mut u8> {
        let state = self.state.as_ref().ok_or(MmError::InvalidPtr(ptr))?;
        let idx = ptr.shelf_id().shelf_index();
        match state.owned.iter().find(|o| o.idx == idx) {
            Some(owned) => owned.heap.offset_to_ptr(ptr.offset()),
            None => Err(MmError::InvalidPtr(ptr)),
        }
    }
}

impl Drop for DistHeap {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Acquires an unclaimed payload shelf, creating a new one when every
/// published shelf is owned by a live peer. Appends the opened heap to
/// `state.owned` and returns its index.
fn acquire_payload_shelf(pool: &mut Pool, state: &mut OpenState) -> Result<ShelfIndex> {
    let pool_id = pool.pool_id();
    let min_alloc = pool.min_alloc_size().unwrap_or(0);

    for _ in 0..ACQUIRE_RETRIES {
        // try existing shelves we do not own yet
        let slots = pool.size()? as ShelfIndex;
        for idx in 1..slots {
            if !pool.check_shelf(idx)? {
                continue;
            }
            if state.owned.iter().any(|o| o.idx == idx) {
                continue;
            }
            if !state.comm.ownership.acquire_item(idx as usize)? {
                continue;
            }
            let path = pool.get_shelf_path(idx);
            let mut heap = ShelfHeap::new(&path, pool.shelf_id(idx), min_alloc);
            match heap.open() {
                Ok(()) => {
                    state.owned.push(OwnedShelf { idx, heap });
                    return Ok(idx);
                }
                Err(err) => {
                    warn!(pool = pool_id, shelf = idx, error = %err, "acquired shelf failed to open");
                    let _ = state.comm.ownership.release_item(idx as usize);
                }
            }
        }

        // all owned by live peers: publish a fresh shelf
        let next = match first_free_index(pool)? {
            Some(idx) => idx,
            None => break,
        };
        debug!(pool = pool_id, shelf = next, "adding payload shelf");
        let mut format = |shelf: &mut ShelfFile, size: u64| -> Result<()> {
            let mut heap = ShelfHeap::new(shelf.path(), shelf.shelf_id(), min_alloc);
            heap.create(size)
        };
        // a racing peer may publish the same index first; either way the
        // shelf exists afterwards and the retry loop tries to claim it
        let _ = pool.add_shelf(next, &mut format, false);
    }

    Err(MmError::HeapOpenFailed(format!(
        "pool {pool_id} has no acquirable shelf"
    )))
}

fn first_free_index(pool: &Pool) -> Result<Option<ShelfIndex>> {
    for idx in 1..ShelfId::MAX_SHELF_COUNT as ShelfIndex {
        if !pool.check_shelf(idx)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

/// Frees everything other processes queued for shelf `idx`.
fn drain_remote_frees(pool_id: PoolId, state: &OpenState, idx: ShelfIndex) {
    let owned = match state.owned.iter().find(|o| o.idx == idx) {
        Some(owned) => owned,
        None => return,
    };
    let mut drained = 0usize;
    loop {
        match state.comm.freelists.get_pointer(idx) {
            Ok(ptr) => {
                if let Err(err) = owned.heap.free(ptr.offset()) {
                    warn!(pool = pool_id, %ptr, error = %err, "dropping bad remote free");
                }
                drained += 1;
            }
            Err(MmError::FreeListsEmpty) => break,
            Err(err) => {
                warn!(pool = pool_id, error = %err, "free list drain failed");
                break;
            }
        }
    }
    if drained > 0 {
        debug!(pool = pool_id, shelf = idx, drained, "drained remote frees");
    }
}

/// Formats the coordination shelf: the ownership table, then free lists over
/// the rest of the shelf.
fn format_comm_shelf(shelf: &mut ShelfFile, size: u64) -> Result<()> {
    shelf.open(libc::O_RDWR)?;
    let base = match shelf.map(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        0,
        true,
    ) {
        Ok(base) => base,
        Err(err) => {
            let _ = shelf.close();
            return Err(err);
        }
    };
    let own_size = Ownership::footprint(SLOT_COUNT);
    // Safety: base maps the whole freshly truncated shelf.
    let ret = unsafe {
        let mut ownership = Ownership::new(base, own_size);
        ownership.create(SLOT_COUNT)?;
        let mut freelists = FreeLists::new(base.add(own_size as usize), size - own_size);
        freelists.create(SLOT_COUNT)
    };
    let _ = shelf.unmap(base, size, true);
    let _ = shelf.close();
    ret
}

/// Maps the coordination shelf through the registry and opens its two
/// structures.
fn open_comm_shelf(pool: &Pool) -> Result<Comm> {
    if !pool.check_shelf(COMM_SHELF_IDX)? {
        return Err(MmError::ShelfFileNotFound("coordination shelf".into()));
    }
    let path = pool.get_shelf_path(COMM_SHELF_IDX);
    let mut file = ShelfFile::with_id(&path, pool.shelf_id(COMM_SHELF_IDX));
    file.open(libc::O_RDWR)?;
    let len = file.size()?;
    let base = match file.map_registered() {
        Ok(base) => base,
        Err(err) => {
            let _ = file.close();
            return Err(err);
        }
    };
    let own_size = Ownership::footprint(SLOT_COUNT);
    // Safety: base maps the whole comm shelf for as long as Comm lives.
    let (ownership, freelists) = unsafe {
        let mut ownership = Ownership::new(base, own_size);
        let mut freelists = FreeLists::new(base.add(own_size as usize), len - own_size);
        match ownership.open().and_then(|()| freelists.open()) {
            Ok(()) => (ownership, freelists),
            Err(err) => {
                let _ = file.unmap_registered(base, false);
                let _ = file.close();
                return Err(err);
            }
        }
    };
    Ok(Comm {
        file,
        base,
        ownership,
        freelists,
    })
}

fn close_comm_shelf(mut comm: Comm) {
    let _ = comm.freelists.close();
    let _ = comm.ownership.close();
    let _ = comm.file.unmap_registered(comm.base, false);
    let _ = comm.file.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), "test");
        (dir, config)
    }

    #[test]
    fn test_heap_round_trip() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 2);
        heap.create(8 << 20, 0, 0o600).unwrap();
        heap.open().unwrap();

        let mut ptrs = vec![];
        for i in 0..10u64 {
            let ptr = heap.alloc(4);
            assert!(ptr.is_valid());
            let local = heap.global_to_local(ptr).unwrap();
            // Safety: local points at a fresh allocation of >= 8 bytes.
            unsafe { std::ptr::write_volatile(local as *mut u64, i) };
            ptrs.push(ptr);
        }

        // reopen and verify every value survived
        heap.close().unwrap();
        heap.open().unwrap();
        for (i, ptr) in ptrs.iter().enumerate() {
            let local = heap.global_to_local(*ptr).unwrap();
            // Safety: the allocation is still live.
            let val = unsafe { std::ptr::read_volatile(local as *const u64) };
            assert_eq!(val, i as u64);
        }
        for ptr in ptrs {
            heap.free(ptr).unwrap();
        }
        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn test_create_conflicts_and_destroy_missing() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 3);
        heap.create(1 << 20, 0, 0o600).unwrap();
        assert!(matches!(
            heap.create(1 << 20, 0, 0o600),
            Err(MmError::PoolFound(3))
        ));
        heap.destroy().unwrap();
        assert!(matches!(heap.destroy(), Err(MmError::PoolNotFound(3))));
    }

    #[test]
    fn test_open_close_idempotent() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 4);
        heap.create(1 << 20, 0, 0o600).unwrap();
        heap.open().unwrap();
        heap.open().unwrap();
        heap.close().unwrap();
        heap.close().unwrap();
        heap.open().unwrap();
        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn test_alloc_without_open_is_invalid() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 5);
        heap.create(1 << 20, 0, 0o600).unwrap();
        assert!(!heap.alloc(64).is_valid());
        heap.destroy().unwrap();
    }

    #[test]
    fn test_remote_free_hand_off() {
        let (_dir, config) = test_config();
        let mut a = DistHeap::new(&config, 6);
        a.create(1 << 20, 0, 0o600).unwrap();
        a.open().unwrap();

        // second handle plays the remote process: it owns a different shelf
        let mut b = DistHeap::new(&config, 6);
        b.open().unwrap();

        let ptr = a.alloc(64);
        assert!(ptr.is_valid());

        // b does not own ptr's shelf, so its free is queued rather than
        // applied, and b cannot translate the pointer locally
        b.free(ptr).unwrap();
        assert!(b.global_to_local(ptr).is_err());

        // a's next alloc drains the queue for its shelf
        let _ = a.alloc(64);
        b.close().unwrap();
        a.close().unwrap();
        a.destroy().unwrap();
    }

    #[test]
    fn test_zone_heap_reuses_freed_space() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 7);
        // zone shelves reclaim, so alloc/free/alloc cycles must not grow
        heap.create(1 << 20, 64, 0o600).unwrap();
        heap.open().unwrap();
        for _ in 0..100 {
            let ptr = heap.alloc(4096);
            assert!(ptr.is_valid());
            heap.free(ptr).unwrap();
        }
        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn test_exhaustion_returns_invalid_ptr() {
        let (_dir, config) = test_config();
        let mut heap = DistHeap::new(&config, 8);
        // tiny shelves; the pool caps at 16 of them
        heap.create(1 << 16, 0, 0o600).unwrap();
        heap.open().unwrap();
        let mut succeeded = 0usize;
        for _ in 0..10_000usize {
            let ptr = heap.alloc(32 << 10);
            if !ptr.is_valid() {
                break;
            }
            succeeded += 1;
        }
        assert!(succeeded > 0, "some allocations must succeed");
        // once exhausted, further allocs stay invalid
        assert!(!heap.alloc(32 << 10).is_valid());
        heap.close().unwrap();
        heap.destroy().unwrap();
    }
}
