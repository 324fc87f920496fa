// Memory manager
//
// The root object a process talks to: it owns the mapping of the root shelf
// and dispatches pool ids to regions or heaps. The root shelf payload is
// laid out here:
//
//   [0 .. 16 lines)    one fabric spinlock per pool id
//   [16 .. 32 lines)   one pool-type entry per pool id (NONE/REGION/HEAP)
//   [32 .. 33 lines)   the 16-bit region-id bitmap
//   [33 .. 34 lines)   four root global pointers (metadata and address
//                      translation dictionaries)
//
// Pool create/destroy/find are serialized per pool id by the spinlocks, so
// two processes cannot install different pool types under one id. Races the
// locks cannot see (a peer created the pool between our check and create)
// are collapsed into IdFound/IdNotFound at this boundary.

use tracing::{error, trace};

use crate::allocator::dist_heap::DistHeap;
use crate::allocator::pool_region::PoolRegion;
use crate::config::{device_page_size, Config};
use crate::error::{MmError, Result};
use crate::fam::{self, FamSpinlock, CACHE_LINE_SIZE};
use crate::global_ptr::GlobalPtr;
use crate::root_shelf::RootShelf;
use crate::shelf_id::{PoolId, ShelfId};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_mgmt::shelf_file::ShelfFile;
use crate::shelf_mgmt::shelf_manager::ShelfManager;

const MAX_POOLS: usize = ShelfId::MAX_POOL_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
enum PoolType {
    None = 0,
    Region = 1,
    Heap = 2,
}

/// The four root global pointers kept in the root shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootPtrSlot {
    MetadataRegionId = 0,
    MetadataRegionName = 1,
    AtlRegionId = 2,
    AtlRegionName = 3,
}

pub struct MemoryManager {
    config: Config,
    root: RootShelf,
}

impl MemoryManager {
    /// Opens the namespace's root shelf. The shelf must have been created by
    /// `shelfmem::start`; a root shelf that exists but fails verification is
    /// unrecoverable state damage, reported fatally and aborted on, because
    /// every pool descriptor in the namespace hangs off it.
    pub fn new(config: Config) -> Result<Self> {
        let mut root = RootShelf::new(config.root_shelf_path());
        if !root.exist() {
            return Err(MmError::ShelfFileNotFound(
                config.root_shelf_path().display().to_string(),
            ));
        }
        match root.open() {
            Ok(()) => {}
            Err(MmError::ShelfFileInvalidFormat(path)) => {
                error!(%path, "root shelf is corrupt; aborting");
                std::process::abort();
            }
            Err(err) => return Err(err),
        }
        Ok(Self { config, root })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn payload(&self) -> *mut u8 {
        self.root.addr().expect("root shelf is open")
    }

    fn pool_lock(&self, pool_id: PoolId) -> &FamSpinlock {
        debug_assert!((pool_id as usize) < MAX_POOLS);
        // Safety: the spinlock array is the first payload area; pool_id is
        // range limited by its 4-bit representation.
        unsafe {
            &*(self.payload().add(pool_id as usize * CACHE_LINE_SIZE) as *const FamSpinlock)
        }
    }

    fn type_entry(&self, pool_id: PoolId) -> *mut u64 {
        // Safety: the type table starts after the 16 spinlock lines.
        unsafe {
            self.payload()
                .add((MAX_POOLS + pool_id as usize) * CACHE_LINE_SIZE) as *mut u64
        }
    }

    fn get_type(&self, pool_id: PoolId) -> PoolType {
        // Safety: type_entry stays inside the mapped payload.
        match unsafe { fam::atomic_u64_read(self.type_entry(pool_id)) } {
            1 => PoolType::Region,
            2 => PoolType::Heap,
            _ => PoolType::None,
        }
    }

    fn set_type(&self, pool_id: PoolId, pool_type: PoolType) {
        // Safety: type_entry stays inside the mapped payload.
        unsafe {
            fam::atomic_u64_write(self.type_entry(pool_id), pool_type as u64);
            fam::persist(self.type_entry(pool_id) as *const u8, CACHE_LINE_SIZE);
        }
    }

    /// Start of the region-id bitmap line (16 bits used).
    pub fn region_id_bitmap(&self) -> *mut u8 {
        // Safety: the bitmap line follows the type table.
        unsafe { self.payload().add(2 * MAX_POOLS * CACHE_LINE_SIZE) }
    }

    fn root_ptr_cell(&self, slot: RootPtrSlot) -> *mut u64 {
        // Safety: the root pointer line follows the bitmap line.
        unsafe {
            self.payload()
                .add((2 * MAX_POOLS + 1) * CACHE_LINE_SIZE + (slot as usize) * 8) as *mut u64
        }
    }

    /// Reads one of the root global pointers.
    pub fn root_ptr(&self, slot: RootPtrSlot) -> GlobalPtr {
        // Safety: the cell is inside the mapped payload.
        GlobalPtr::from_raw(unsafe { fam::atomic_u64_read(self.root_ptr_cell(slot)) })
    }

    /// Installs a root pointer if the cell is still empty; returns the
    /// pointer that ends up installed (the existing one when a peer won).
    pub fn set_root_ptr(&self, slot: RootPtrSlot, ptr: GlobalPtr) -> GlobalPtr {
        let cell = self.root_ptr_cell(slot);
        // Safety: the cell is inside the mapped payload.
        let prev = unsafe { fam::atomic_u64_compare_and_store(cell, 0, ptr.to_raw()) };
        if prev == 0 {
            fam::persist(cell as *const u8, 8);
            ptr
        } else {
            GlobalPtr::from_raw(prev)
        }
    }

    // -- regions ----------------------------------------------------------

    pub fn create_region(&self, pool_id: PoolId, size: u64) -> Result<()> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        if self.get_type(pool_id) != PoolType::None {
            lock.unlock();
            return Err(MmError::IdFound(pool_id));
        }
        let mut region = PoolRegion::new(&self.config, pool_id);
        let ret = region.create(size);
        match ret {
            Ok(()) => {
                self.set_type(pool_id, PoolType::Region);
                lock.unlock();
                trace!(pool_id, size, "region created");
                Ok(())
            }
            Err(err) => {
                lock.unlock();
                error!(pool_id, error = %err, "region creation failed");
                Err(MmError::IdFound(pool_id))
            }
        }
    }

    pub fn destroy_region(&self, pool_id: PoolId) -> Result<()> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        if self.get_type(pool_id) != PoolType::Region {
            lock.unlock();
            return Err(MmError::IdNotFound(pool_id));
        }
        let mut region = PoolRegion::new(&self.config, pool_id);
        let ret = region.destroy();
        match ret {
            Ok(()) => {
                self.set_type(pool_id, PoolType::None);
                lock.unlock();
                trace!(pool_id, "region destroyed");
                Ok(())
            }
            Err(err) => {
                lock.unlock();
                error!(pool_id, error = %err, "region destroy failed");
                Err(MmError::IdNotFound(pool_id))
            }
        }
    }

    /// Returns a fresh handle to the region under `pool_id`. Every call
    /// returns a new handle; open it once and keep it.
    pub fn find_region(&self, pool_id: PoolId) -> Result<PoolRegion> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        let pool_type = self.get_type(pool_id);
        lock.unlock();
        if pool_type != PoolType::Region {
            return Err(MmError::IdNotFound(pool_id));
        }
        let region = PoolRegion::new(&self.config, pool_id);
        if !region.exist() {
            return Err(MmError::IdNotFound(pool_id));
        }
        Ok(region)
    }

    // -- heaps ------------------------------------------------------------

    pub fn create_heap(
        &self,
        pool_id: PoolId,
        shelf_size: u64,
        min_alloc_size: u64,
        mode: u32,
    ) -> Result<()> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        if self.get_type(pool_id) != PoolType::None {
            lock.unlock();
            return Err(MmError::IdFound(pool_id));
        }
        let mut heap = DistHeap::new(&self.config, pool_id);
        let ret = heap.create(shelf_size, min_alloc_size, mode);
        match ret {
            Ok(()) => {
                self.set_type(pool_id, PoolType::Heap);
                lock.unlock();
                trace!(pool_id, shelf_size, "heap created");
                Ok(())
            }
            Err(err) => {
                lock.unlock();
                error!(pool_id, error = %err, "heap creation failed");
                Err(MmError::IdFound(pool_id))
            }
        }
    }

    pub fn destroy_heap(&self, pool_id: PoolId) -> Result<()> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        if self.get_type(pool_id) != PoolType::Heap {
            lock.unlock();
            return Err(MmError::IdNotFound(pool_id));
        }
        let mut heap = DistHeap::new(&self.config, pool_id);
        let ret = heap.destroy();
        match ret {
            Ok(()) => {
                self.set_type(pool_id, PoolType::None);
                lock.unlock();
                trace!(pool_id, "heap destroyed");
                Ok(())
            }
            Err(err) => {
                lock.unlock();
                error!(pool_id, error = %err, "heap destroy failed");
                Err(MmError::IdNotFound(pool_id))
            }
        }
    }

    /// Returns a fresh handle to the heap under `pool_id`. Every call
    /// returns a new handle; open it once and keep it.
    pub fn find_heap(&self, pool_id: PoolId) -> Result<DistHeap> {
        check_pool_id(pool_id)?;
        let lock = self.pool_lock(pool_id);
        lock.lock();
        let pool_type = self.get_type(pool_id);
        lock.unlock();
        if pool_type != PoolType::Heap {
            return Err(MmError::IdNotFound(pool_id));
        }
        let heap = DistHeap::new(&self.config, pool_id);
        if !heap.exist() {
            return Err(MmError::IdNotFound(pool_id));
        }
        Ok(heap)
    }

    // -- pointer access ---------------------------------------------------

    /// Maps just the page-aligned window covering `[ptr, ptr + size)` of the
    /// pointer's shelf and returns the address corresponding to `ptr`.
    pub fn map_pointer(
        &self,
        ptr: GlobalPtr,
        size: u64,
        addr_hint: *mut libc::c_void,
        prot: libc::c_int,
        flags: libc::c_int,
    ) -> Result<*mut u8> {
        if !ptr.is_valid() {
            return Err(MmError::InvalidPtr(ptr));
        }
        let shelf_id = ptr.shelf_id();
        let offset = ptr.offset();
        let page = device_page_size();
        let aligned_start = offset - offset % page;
        let aligned_size = fam::round_up(offset + size, page) - aligned_start;

        let mut pool = Pool::new(&self.config, shelf_id.pool_id());
        pool.open(false).map_err(|_| MmError::MapPointerFailed(ptr))?;
        if !pool
            .check_shelf(shelf_id.shelf_index())
            .map_err(|_| MmError::MapPointerFailed(ptr))?
        {
            let _ = pool.close();
            return Err(MmError::MapPointerFailed(ptr));
        }
        let path = pool.get_shelf_path(shelf_id.shelf_index());

        let mut shelf = ShelfFile::with_id(&path, shelf_id);
        let mapped = match shelf.open(libc::O_RDWR) {
            Ok(()) => shelf.map(
                addr_hint,
                aligned_size,
                prot,
                flags,
                aligned_start as i64,
                false,
            ),
            Err(err) => Err(err),
        };
        let _ = shelf.close();
        let _ = pool.close();
        let aligned_addr = mapped.map_err(|_| MmError::MapPointerFailed(ptr))?;

        // Safety: the window covers offset, so the displacement stays inside.
        let addr = unsafe { aligned_addr.add((offset - aligned_start) as usize) };
        trace!(%ptr, ?addr, aligned_start, aligned_size, "pointer mapped");
        Ok(addr)
    }

    /// Unmaps a window produced by [`Self::map_pointer`].
    pub fn unmap_pointer(&self, ptr: GlobalPtr, mapped_addr: *mut u8, size: u64) -> Result<()> {
        let offset = ptr.offset();
        let page = device_page_size();
        let aligned_start = offset - offset % page;
        let aligned_size = fam::round_up(offset + size, page) - aligned_start;
        // Safety: mapped_addr came from map_pointer, offset % page inside.
        let aligned_addr = unsafe { mapped_addr.sub((offset - aligned_start) as usize) };
        ShelfFile::unmap_raw(aligned_addr, aligned_size, false, page)
    }

    /// Local address of a global pointer, or null when the pointer is
    /// invalid or its shelf cannot be mapped. The shelf is mapped through
    /// the shared registry on first touch and stays mapped.
    pub fn global_to_local(&self, ptr: GlobalPtr) -> *mut u8 {
        if !ptr.is_valid() {
            return std::ptr::null_mut();
        }
        let shelf_id = ptr.shelf_id();
        let registry = ShelfManager::global();
        let base = match registry.find_base(shelf_id) {
            Some(base) => base,
            None => {
                // slow path: first touch of this shelf in this process
                let mut pool = Pool::new(&self.config, shelf_id.pool_id());
                if pool.open(false).is_err() {
                    return std::ptr::null_mut();
                }
                let path = pool.get_shelf_path(shelf_id.shelf_index());
                let base = registry.find_base_or_map(&path, shelf_id);
                let _ = pool.close();
                match base {
                    Some(base) => base,
                    None => return std::ptr::null_mut(),
                }
            }
        };
        // Safety: offsets of valid pointers stay inside the shelf mapping.
        unsafe { base.add(ptr.offset() as usize) }
    }

    /// Global pointer naming `addr`, or the invalid pointer when `addr` is
    /// not inside any shelf this process has mapped through the registry.
    pub fn local_to_global(&self, addr: *const u8) -> GlobalPtr {
        match ShelfManager::global().find_shelf(addr) {
            Some((shelf_id, base)) => {
                let offset = addr as u64 - base as u64;
                GlobalPtr::new(shelf_id, offset)
            }
            None => GlobalPtr::INVALID,
        }
    }
}

fn check_pool_id(pool_id: PoolId) -> Result<()> {
    if pool_id == 0 || pool_id as usize >= MAX_POOLS {
        return Err(MmError::InvalidArgument(format!(
            "pool id {pool_id} out of range"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, MemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), "test");
        let mut root = RootShelf::new(config.root_shelf_path());
        root.create().unwrap();
        (dir, MemoryManager::new(config).unwrap())
    }

    #[test]
    fn test_missing_root_shelf() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), "test");
        assert!(matches!(
            MemoryManager::new(config),
            Err(MmError::ShelfFileNotFound(_))
        ));
    }

    #[test]
    fn test_region_id_dispatch() {
        let (_dir, mm) = manager();
        mm.create_region(1, 1 << 20).unwrap();
        assert!(matches!(
            mm.create_region(1, 1 << 20),
            Err(MmError::IdFound(1))
        ));
        // a heap may not squat on a region id
        assert!(matches!(
            mm.create_heap(1, 1 << 20, 0, 0o600),
            Err(MmError::IdFound(1))
        ));
        assert!(matches!(mm.destroy_heap(1), Err(MmError::IdNotFound(1))));

        let mut region = mm.find_region(1).unwrap();
        region.open(libc::O_RDWR).unwrap();
        assert_eq!(region.size(), 1 << 20);
        region.close().unwrap();

        mm.destroy_region(1).unwrap();
        assert!(matches!(mm.find_region(1), Err(MmError::IdNotFound(1))));
        assert!(matches!(mm.destroy_region(1), Err(MmError::IdNotFound(1))));
    }

    #[test]
    fn test_heap_round_trip_through_manager() {
        let (_dir, mm) = manager();
        mm.create_heap(9, 8 << 20, 0, 0o600).unwrap();

        let mut heap = mm.find_heap(9).unwrap();
        heap.open().unwrap();
        let ptr = heap.alloc(64);
        assert!(ptr.is_valid());

        // translation through the shared registry
        let local = mm.global_to_local(ptr);
        assert!(!local.is_null());
        // Safety: local points at a live 64-byte allocation.
        unsafe { std::ptr::write_volatile(local as *mut u64, 7) };
        assert_eq!(mm.local_to_global(local), ptr);

        heap.free(ptr).unwrap();
        heap.close().unwrap();
        mm.destroy_heap(9).unwrap();
    }

    #[test]
    fn test_global_to_local_invalid_yields_null() {
        let (_dir, mm) = manager();
        assert!(mm.global_to_local(GlobalPtr::INVALID).is_null());
        let bogus = GlobalPtr::new(ShelfId::new(14, 3), 4096);
        assert!(mm.global_to_local(bogus).is_null());
        let stack_local = 0u64;
        assert_eq!(
            mm.local_to_global(&stack_local as *const u64 as *const u8),
            GlobalPtr::INVALID
        );
    }

    #[test]
    fn test_map_pointer_window() {
        let (_dir, mm) = manager();
        mm.create_heap(10, 8 << 20, 0, 0o600).unwrap();
        let mut heap = mm.find_heap(10).unwrap();
        heap.open().unwrap();
        let ptr = heap.alloc(64);
        assert!(ptr.is_valid());

        let addr = mm
            .map_pointer(
                ptr,
                64,
                std::ptr::null_mut(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
            )
            .unwrap();
        // Safety: addr maps the allocation through a second window.
        unsafe { fam::atomic_u64_write(addr as *mut u64, 99) };
        mm.unmap_pointer(ptr, addr, 64).unwrap();

        // visible through the registry mapping as well
        let local = heap.global_to_local(ptr).unwrap();
        // Safety: local points at the same allocation.
        assert_eq!(unsafe { fam::atomic_u64_read(local as *const u64) }, 99);

        heap.close().unwrap();
        mm.destroy_heap(10).unwrap();
    }

    #[test]
    fn test_root_ptrs_cas_once() {
        let (_dir, mm) = manager();
        let slot = RootPtrSlot::MetadataRegionId;
        assert_eq!(mm.root_ptr(slot), GlobalPtr::INVALID);
        let first = GlobalPtr::new(ShelfId::new(1, 0), 128);
        let second = GlobalPtr::new(ShelfId::new(1, 0), 256);
        assert_eq!(mm.set_root_ptr(slot, first), first);
        // the loser observes the winner's pointer
        assert_eq!(mm.set_root_ptr(slot, second), first);
        assert_eq!(mm.root_ptr(slot), first);
        // other slots are independent
        assert_eq!(mm.root_ptr(RootPtrSlot::AtlRegionName), GlobalPtr::INVALID);
    }

    #[test]
    fn test_pool_id_zero_rejected() {
        let (_dir, mm) = manager();
        assert!(mm.create_region(0, 4096).is_err());
        assert!(mm.find_heap(0).is_err());
    }
}
