// Free lists for remote free hand-off
//
// An array of lock-free stacks, typically one per shelf of a pool, by which
// any process hands a global pointer to the single owner of another shelf
// for deferred free. Queued pointers ride in 16-byte blocks from a
// FixedBlockAllocator living in the same area: the first word is the stack
// link, the second the pointer being handed off.
//
// Layout (offsets from the area base):
//   [0..64)        header { magic, size, list_count }
//   [64..64+S)     list_count Stacks, rounded up to a cache line
//   [64+S..size)   FixedBlockAllocator holding the hand-off blocks

use tracing::{trace, warn};

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};
use crate::global_ptr::GlobalPtr;
use crate::shelf_id::ShelfIndex;
use crate::shelf_usage::fixed_block::FixedBlockAllocator;
use crate::shelf_usage::stack::Stack;

const FREELISTS_MAGIC: u64 = 373354787;
const HANDOFF_BLOCK_SIZE: u64 = 16;

#[repr(C)]
struct FreeListsHeader {
    magic: u64,
    size: u64,
    list_count: u64,
}

struct OpenState {
    size: u64,
    list_count: u64,
    fba: FixedBlockAllocator,
}

pub struct FreeLists {
    base: *mut u8,
    avail_size: u64,
    state: Option<OpenState>,
}

// Safety: all mutation of the shared area goes through fam atomics.
unsafe impl Send for FreeLists {}

fn header_size() -> u64 {
    fam::round_up(std::mem::size_of::<FreeListsHeader>() as u64, CACHE_LINE_SIZE as u64)
}

fn stacks_size(list_count: u64) -> u64 {
    fam::round_up(
        list_count * std::mem::size_of::<Stack>() as u64,
        CACHE_LINE_SIZE as u64,
    )
}

impl FreeLists {
    /// # Safety
    /// `addr` must be cache-line aligned and map at least `avail_size` bytes
    /// of shared shelf memory that stays mapped for the life of this value.
    pub unsafe fn new(addr: *mut u8, avail_size: u64) -> Self {
        debug_assert!(!addr.is_null());
        debug_assert_eq!(addr as usize % CACHE_LINE_SIZE, 0);
        Self {
            base: addr,
            avail_size,
            state: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Size consumed on the shelf; after create/open this is the recorded
    /// total, before that the available size.
    pub fn size(&self) -> u64 {
        match &self.state {
            Some(state) => state.size,
            None => self.avail_size,
        }
    }

    pub fn count(&self) -> u64 {
        self.state.as_ref().map(|s| s.list_count).unwrap_or(0)
    }

    pub fn verify(&self) -> bool {
        // Safety: base maps at least one cache line.
        unsafe { fam::atomic_u64_read(self.base as *const u64) == FREELISTS_MAGIC }
    }

    pub fn create(&mut self, list_count: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        debug_assert!(list_count != 0);

        let header_size = header_size();
        let stacks_size = stacks_size(list_count);
        let fixed = header_size + stacks_size;
        if self.avail_size <= fixed {
            warn!(avail = self.avail_size, "freelists area too small");
            return Err(MmError::FreeListsCreateFailed);
        }

        // Safety: base maps avail_size bytes; we stay inside it.
        unsafe {
            std::ptr::write_bytes(self.base, 0, fixed as usize);
            fam::persist(self.base, fixed as usize);

            let fba_base = self.base.add(fixed as usize);
            let fba = FixedBlockAllocator::create(
                fba_base,
                HANDOFF_BLOCK_SIZE,
                0,
                0,
                self.avail_size - fixed,
            )
            .map_err(|_| MmError::FreeListsCreateFailed)?;

            let header = self.base as *mut FreeListsHeader;
            (*header).list_count = list_count;
            (*header).size = fixed + fba.size();
            fam::persist(self.base, header_size as usize);
            fam::atomic_u64_write(&mut (*header).magic, FREELISTS_MAGIC);
            fam::persist(self.base, header_size as usize);
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.verify() {
            return Err(MmError::FreeListsDestroyFailed);
        }
        // Safety: base maps the recorded size.
        unsafe {
            let header = self.base as *mut FreeListsHeader;
            let size = fam::atomic_u64_read(&(*header).size);
            fam::atomic_u64_write(&mut (*header).magic, 0);
            fam::persist(self.base, CACHE_LINE_SIZE);
            std::ptr::write_bytes(self.base, 0, size as usize);
            fam::persist(self.base, size as usize);
        }
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.verify() {
            warn!("freelists magic mismatch");
            return Err(MmError::FreeListsOpenFailed);
        }
        // Safety: base maps at least the header.
        let (size, list_count) = unsafe {
            let header = self.base as *const FreeListsHeader;
            (
                fam::atomic_u64_read(&(*header).size),
                fam::atomic_u64_read(&(*header).list_count),
            )
        };
        if size > self.avail_size {
            warn!(size, avail = self.avail_size, "freelists larger than area");
            return Err(MmError::FreeListsOpenFailed);
        }
        let fixed = header_size() + stacks_size(list_count);
        // Safety: the recorded size covers the allocator area.
        let fba = unsafe {
            FixedBlockAllocator::open(
                self.base.add(fixed as usize),
                HANDOFF_BLOCK_SIZE,
                size - fixed,
            )
            .map_err(|_| MmError::FreeListsOpenFailed)?
        };
        self.state = Some(OpenState {
            size,
            list_count,
            fba,
        });
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state.take().is_none() {
            return Err(MmError::InvalidArgument("freelists not open".into()));
        }
        Ok(())
    }

    fn list(&self, shelf_idx: ShelfIndex) -> Result<(&Stack, &FixedBlockAllocator)> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| MmError::InvalidArgument("freelists not open".into()))?;
        if (shelf_idx as u64) >= state.list_count {
            return Err(MmError::InvalidArgument(format!(
                "freelist index {shelf_idx} out of range"
            )));
        }
        // Safety: the stack array sits right after the header and the index
        // was bounds-checked above.
        let stack = unsafe {
            &*(self
                .base
                .add(header_size() as usize + shelf_idx as usize * std::mem::size_of::<Stack>())
                as *const Stack)
        };
        Ok((stack, &state.fba))
    }

    /// Queues `ptr` for the owner of shelf `shelf_idx`. The caller must pass
    /// a pointer belonging to this pool. Exhaustion of the hand-off blocks
    /// drops the pointer, as a full queue must never stall the freeing
    /// process.
    pub fn put_pointer(&self, shelf_idx: ShelfIndex, ptr: GlobalPtr) -> Result<()> {
        let (stack, fba) = self.list(shelf_idx)?;
        let block = fba.alloc();
        if block == 0 {
            warn!(%ptr, shelf_idx, "freelist hand-off blocks exhausted; pointer dropped");
            return Ok(());
        }
        // Safety: block is a live 16-byte hand-off block in the fba area.
        unsafe {
            let slot = fba.from_offset(block).add(8) as *mut u64;
            fam::atomic_u64_write(slot, ptr.to_raw());
            stack.push(fba.base(), block);
        }
        trace!(%ptr, shelf_idx, "pointer queued for remote free");
        Ok(())
    }

    /// Dequeues a pointer for shelf `shelf_idx`; `FreeListsEmpty` when the
    /// list is drained.
    pub fn get_pointer(&self, shelf_idx: ShelfIndex) -> Result<GlobalPtr> {
        let (stack, fba) = self.list(shelf_idx)?;
        // Safety: the stack's blocks live in the fba area.
        let block = unsafe { stack.pop(fba.base()) };
        if block == 0 {
            return Err(MmError::FreeListsEmpty);
        }
        // Safety: we own the popped block until it is freed below.
        let raw = unsafe {
            let slot = fba.from_offset(block).add(8) as *const u64;
            fam::atomic_u64_read(slot)
        };
        fba.free(block);
        let ptr = GlobalPtr::from_raw(raw);
        trace!(%ptr, shelf_idx, "pointer dequeued for local free");
        Ok(ptr)
    }
}

impl Drop for FreeLists {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shelf_id::ShelfId;

    const AREA: usize = 256 * 1024;

    #[repr(C, align(64))]
    struct Area([u8; AREA]);

    fn new_lists(area: &mut Box<Area>, list_count: u64) -> FreeLists {
        let base = area.0.as_mut_ptr();
        let mut lists = unsafe { FreeLists::new(base, AREA as u64) };
        lists.create(list_count).unwrap();
        lists.open().unwrap();
        lists
    }

    #[test]
    fn test_lifo_per_index() {
        let mut area = Box::new(Area([0; AREA]));
        let lists = new_lists(&mut area, 16);

        for idx in 0..16u8 {
            for j in 1..=10u64 {
                let gp = GlobalPtr::new(ShelfId::new(1, idx), j * 64);
                lists.put_pointer(idx, gp).unwrap();
            }
        }
        for idx in 0..16u8 {
            for j in (1..=10u64).rev() {
                let gp = lists.get_pointer(idx).unwrap();
                assert_eq!(gp, GlobalPtr::new(ShelfId::new(1, idx), j * 64));
            }
            assert!(matches!(
                lists.get_pointer(idx),
                Err(MmError::FreeListsEmpty)
            ));
        }
    }

    #[test]
    fn test_reopen_keeps_contents() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        {
            let mut lists = unsafe { FreeLists::new(base, AREA as u64) };
            lists.create(4).unwrap();
            lists.open().unwrap();
            lists
                .put_pointer(2, GlobalPtr::new(ShelfId::new(3, 2), 128))
                .unwrap();
            lists.close().unwrap();
        }
        {
            let mut lists = unsafe { FreeLists::new(base, AREA as u64) };
            assert!(lists.verify());
            lists.open().unwrap();
            assert_eq!(lists.count(), 4);
            assert_eq!(
                lists.get_pointer(2).unwrap(),
                GlobalPtr::new(ShelfId::new(3, 2), 128)
            );
        }
    }

    #[test]
    fn test_destroy_clears_magic() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        let mut lists = unsafe { FreeLists::new(base, AREA as u64) };
        lists.create(2).unwrap();
        assert!(lists.verify());
        lists.destroy().unwrap();
        assert!(!lists.verify());
        assert!(lists.open().is_err());
    }

    #[test]
    fn test_out_of_range_index() {
        let mut area = Box::new(Area([0; AREA]));
        let lists = new_lists(&mut area, 2);
        assert!(lists
            .put_pointer(5, GlobalPtr::new(ShelfId::new(1, 1), 64))
            .is_err());
    }

    #[test]
    fn test_create_rejects_tiny_area() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        let mut lists = unsafe { FreeLists::new(base, 128) };
        assert!(matches!(
            lists.create(16),
            Err(MmError::FreeListsCreateFailed)
        ));
    }
}
