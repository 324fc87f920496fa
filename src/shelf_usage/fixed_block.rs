// Fixed-size block allocator
//
// Carves an area of one shelf into equal blocks. A freed block goes onto a
// lock-free Stack; allocation pops the stack first and falls back to bumping
// a next-unused cursor until the area is exhausted. Block sizes are rounded
// up to a cache line so every block satisfies the Stack's alignment and
// length contract.
//
// Layout (offsets from the area base):
//   [0..64)    header { block_size, user_metadata_size, initial_pool_size,
//                       max_pool_size, next_unused }
//   [64..128)  free stack
//   [128..)    user metadata (rounded up to a cache line), then blocks
//
// All offsets handed out are relative to the area base; 0 means "no block".

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};
use crate::global_ptr::Offset;
use crate::shelf_usage::stack::Stack;

#[repr(C)]
struct FbaHeader {
    block_size: u64,
    user_metadata_size: u64,
    initial_pool_size: u64,
    max_pool_size: u64,
    next_unused: u64,
    _pad0: [u8; CACHE_LINE_SIZE - 40],
    free_stack: Stack,
    _pad1: [u8; CACHE_LINE_SIZE - 16],
}

pub struct FixedBlockAllocator {
    base: *mut u8,
    size: u64,
}

// Safety: all mutation of the shared area goes through fam atomics.
unsafe impl Send for FixedBlockAllocator {}
unsafe impl Sync for FixedBlockAllocator {}

impl FixedBlockAllocator {
    fn data_start(user_metadata_size: u64) -> u64 {
        std::mem::size_of::<FbaHeader>() as u64
            + fam::round_up(user_metadata_size, CACHE_LINE_SIZE as u64)
    }

    /// Formats a fresh allocator over `[addr, addr + avail_size)`.
    ///
    /// # Safety
    /// `addr` must be cache-line aligned and map at least `avail_size` bytes
    /// of zero-initialized shelf memory with no concurrent opener.
    pub unsafe fn create(
        addr: *mut u8,
        block_size: u64,
        user_metadata_size: u64,
        initial_pool_size: u64,
        avail_size: u64,
    ) -> Result<Self> {
        debug_assert_eq!(addr as usize % CACHE_LINE_SIZE, 0);
        let block_size = fam::round_up(block_size.max(1), CACHE_LINE_SIZE as u64);
        let data_start = Self::data_start(user_metadata_size);
        if avail_size < data_start + block_size {
            return Err(MmError::InvalidArgument(format!(
                "fixed block area too small: {avail_size} bytes"
            )));
        }
        let header = addr as *mut FbaHeader;
        (*header).block_size = block_size;
        (*header).user_metadata_size = user_metadata_size;
        (*header).initial_pool_size = initial_pool_size;
        (*header).max_pool_size = avail_size;
        (*header).next_unused = data_start;
        (*header).free_stack.init();
        fam::persist(addr, data_start as usize);
        Ok(Self {
            base: addr,
            size: avail_size,
        })
    }

    /// Adopts an existing allocator; the recorded block size must match.
    ///
    /// # Safety
    /// `addr` must be the base a prior `create` formatted, mapped for at
    /// least `avail_size` bytes.
    pub unsafe fn open(addr: *mut u8, block_size: u64, avail_size: u64) -> Result<Self> {
        debug_assert_eq!(addr as usize % CACHE_LINE_SIZE, 0);
        let header = addr as *const FbaHeader;
        let expect = fam::round_up(block_size.max(1), CACHE_LINE_SIZE as u64);
        let recorded = fam::read_u64(&(*header).block_size);
        if recorded != expect {
            return Err(MmError::ShelfFileInvalidFormat(format!(
                "fixed block size mismatch: recorded {recorded}, expected {expect}"
            )));
        }
        if fam::read_u64(&(*header).max_pool_size) > avail_size {
            return Err(MmError::ShelfFileInvalidFormat(
                "fixed block area shrank".into(),
            ));
        }
        Ok(Self {
            base: addr,
            size: avail_size,
        })
    }

    fn header(&self) -> *mut FbaHeader {
        self.base as *mut FbaHeader
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u64 {
        // Safety: base maps at least the header.
        unsafe { fam::read_u64(&(*self.header()).block_size) }
    }

    pub fn user_metadata_size(&self) -> u64 {
        // Safety: base maps at least the header.
        unsafe { fam::read_u64(&(*self.header()).user_metadata_size) }
    }

    /// Start of the caller-owned metadata area, or null when none was
    /// reserved.
    pub fn user_metadata(&self) -> *mut u8 {
        if self.user_metadata_size() == 0 {
            return std::ptr::null_mut();
        }
        // Safety: the metadata area sits right after the header.
        unsafe { self.base.add(std::mem::size_of::<FbaHeader>()) }
    }

    /// Upper bound on blocks this area can ever hand out.
    pub fn max_blocks(&self) -> u64 {
        let data_start = Self::data_start(self.user_metadata_size());
        // Safety: base maps at least the header.
        let max_pool = unsafe { fam::read_u64(&(*self.header()).max_pool_size) };
        (max_pool - data_start) / self.block_size()
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn from_offset(&self, offset: Offset) -> *mut u8 {
        if offset == 0 {
            return std::ptr::null_mut();
        }
        // Safety: offsets come from this allocator and stay within the area.
        unsafe { self.base.add(offset as usize) }
    }

    pub fn to_offset(&self, ptr: *const u8) -> Offset {
        if ptr.is_null() {
            return 0;
        }
        ptr as u64 - self.base as u64
    }

    /// Pops a free block, or bumps the unused cursor; 0 when exhausted.
    pub fn alloc(&self) -> Offset {
        let header = self.header();
        // Safety: base maps the header and the stack.
        unsafe {
            let block = (*header).free_stack.pop(self.base);
            if block != 0 {
                return block;
            }
            let block_size = fam::read_u64(&(*header).block_size);
            let max_pool = fam::read_u64(&(*header).max_pool_size);
            let mut cur = fam::atomic_u64_read(&(*header).next_unused);
            loop {
                if cur + block_size > max_pool {
                    return 0;
                }
                let prev = fam::atomic_u64_compare_and_store(
                    &mut (*header).next_unused,
                    cur,
                    cur + block_size,
                );
                if prev == cur {
                    return cur;
                }
                cur = prev;
            }
        }
    }

    /// Returns a block; the block body is persisted before it becomes
    /// reachable through the free stack. `free(0)` is a no-op.
    pub fn free(&self, block: Offset) {
        if block == 0 {
            return;
        }
        fam::persist(self.from_offset(block), self.block_size() as usize);
        self.unsafe_free(block);
    }

    /// Like [`Self::free`] but skips the persist; for callers that already
    /// persisted every write to the block.
    pub fn unsafe_free(&self, block: Offset) {
        if block == 0 {
            return;
        }
        // Safety: base maps the stack; block came from alloc on this area.
        unsafe { (*self.header()).free_stack.push(self.base, block) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AREA: usize = 64 * 1024;

    #[repr(C, align(64))]
    struct Area([u8; AREA]);

    fn new_area() -> Box<Area> {
        Box::new(Area([0; AREA]))
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let mut area = new_area();
        let base = area.0.as_mut_ptr();
        let fba = unsafe { FixedBlockAllocator::create(base, 16, 0, 0, AREA as u64).unwrap() };

        // documented rounding: 16-byte request becomes one cache line
        assert_eq!(fba.block_size(), 64);
        let max = fba.max_blocks();
        let mut blocks = vec![];
        loop {
            let block = fba.alloc();
            if block == 0 {
                break;
            }
            assert_eq!(block % 64, 0);
            blocks.push(block);
        }
        assert_eq!(blocks.len() as u64, max);

        // every block distinct
        let mut sorted = blocks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), blocks.len());

        // freeing one makes exactly one more alloc possible
        fba.free(blocks[3]);
        assert_eq!(fba.alloc(), blocks[3]);
        assert_eq!(fba.alloc(), 0);
    }

    #[test]
    fn test_open_validates_block_size() {
        let mut area = new_area();
        let base = area.0.as_mut_ptr();
        unsafe {
            FixedBlockAllocator::create(base, 64, 0, 0, AREA as u64).unwrap();
            assert!(FixedBlockAllocator::open(base, 64, AREA as u64).is_ok());
            assert!(FixedBlockAllocator::open(base, 128, AREA as u64).is_err());
        }
    }

    #[test]
    fn test_user_metadata_area() {
        let mut area = new_area();
        let base = area.0.as_mut_ptr();
        let fba =
            unsafe { FixedBlockAllocator::create(base, 64, 100, 0, AREA as u64).unwrap() };
        let md = fba.user_metadata();
        assert!(!md.is_null());
        assert_eq!(md as usize % CACHE_LINE_SIZE, 0);
        // first block starts beyond the rounded metadata area
        let first = fba.alloc();
        assert!(first >= (128 + 128) as u64);
    }

    #[test]
    fn test_offset_conversions() {
        let mut area = new_area();
        let base = area.0.as_mut_ptr();
        let fba = unsafe { FixedBlockAllocator::create(base, 64, 0, 0, AREA as u64).unwrap() };
        let block = fba.alloc();
        let ptr = fba.from_offset(block);
        assert_eq!(fba.to_offset(ptr), block);
        assert!(fba.from_offset(0).is_null());
        assert_eq!(fba.to_offset(std::ptr::null()), 0);
    }
}
