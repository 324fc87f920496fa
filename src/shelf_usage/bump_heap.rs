// Bump-allocating shelf layout
//
// The default per-shelf heap: three cache lines of header (magic, capacity,
// next-free cursor) followed by the payload. Allocation is a CAS loop that
// advances the cursor by the rounded request; the cursor only ever grows, so
// Free is a no-op and space comes back only when the shelf is destroyed.
//
// Offsets handed out are absolute (from the layout base), which keeps 0 free
// to mean null.

use crate::fam::{self, CACHE_LINE_SIZE};
use crate::global_ptr::Offset;

pub const BUMP_MAGIC: u64 = 684327;

/// Header plus payload; the payload is addressed through the offsets, never
/// through this struct.
#[repr(C)]
pub struct BumpLayout {
    magic: u64,
    _pad0: [u8; CACHE_LINE_SIZE - 8],
    heap_size: u64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
    next_free: u64,
    _pad2: [u8; CACHE_LINE_SIZE - 8],
}

/// Bytes the header occupies before the payload.
pub const METADATA_SIZE: u64 = (CACHE_LINE_SIZE * 3) as u64;

impl BumpLayout {
    /// Formats a bump heap of `heap_size` payload bytes at `addr`.
    ///
    /// # Safety
    /// `addr` must be cache-line aligned and map `METADATA_SIZE + heap_size`
    /// bytes with no concurrent opener.
    pub unsafe fn create(addr: *mut u8, heap_size: u64) {
        debug_assert!(!addr.is_null());
        debug_assert!(heap_size != 0);
        let layout = addr as *mut BumpLayout;
        (*layout).next_free = METADATA_SIZE;
        (*layout).heap_size = heap_size;
        std::ptr::write_bytes(addr.add(METADATA_SIZE as usize), 0, heap_size as usize);
        fam::persist(
            addr.add(CACHE_LINE_SIZE),
            (METADATA_SIZE - CACHE_LINE_SIZE as u64 + heap_size) as usize,
        );
        fam::atomic_u64_write(&mut (*layout).magic, BUMP_MAGIC);
        fam::persist(addr, CACHE_LINE_SIZE);
    }

    /// Clears the layout, magic first.
    ///
    /// # Safety
    /// Same mapping requirements as `create`; no concurrent opener.
    pub unsafe fn destroy(addr: *mut u8) {
        let layout = addr as *mut BumpLayout;
        let heap_size = (*layout).heap_size;
        fam::atomic_u64_write(&mut (*layout).magic, 0);
        fam::persist(addr, CACHE_LINE_SIZE);
        (*layout).next_free = 0;
        (*layout).heap_size = 0;
        std::ptr::write_bytes(addr.add(METADATA_SIZE as usize), 0, heap_size as usize);
        fam::persist(
            addr.add(CACHE_LINE_SIZE),
            (METADATA_SIZE - CACHE_LINE_SIZE as u64 + heap_size) as usize,
        );
    }

    /// # Safety
    /// `addr` must map at least one cache line.
    pub unsafe fn verify(addr: *const u8) -> bool {
        fam::atomic_u64_read(addr as *const u64) == BUMP_MAGIC
    }

    /// # Safety
    /// `addr` must map a formatted layout.
    pub unsafe fn view<'a>(addr: *mut u8) -> &'a BumpLayout {
        &*(addr as *const BumpLayout)
    }

    pub fn size(&self) -> u64 {
        // Safety: self lives inside the mapping.
        unsafe { fam::read_u64(&self.heap_size) }
    }

    fn next_free(&self) -> Offset {
        // Safety: self lives inside the mapping.
        unsafe { fam::atomic_u64_read(&self.next_free) }
    }

    /// Allocates `size` bytes rounded up to a cache line; 0 when the heap is
    /// exhausted. Returned offsets are absolute and cache-line aligned.
    pub fn alloc(&self, size: u64) -> Offset {
        let rounded = fam::round_up(size.max(1), CACHE_LINE_SIZE as u64);
        let heap_size = self.size();
        let mut expected = self.next_free();
        loop {
            let desired = expected + rounded;
            if desired - METADATA_SIZE > heap_size {
                return 0;
            }
            // Safety: self lives inside the mapping.
            let actual = unsafe {
                fam::atomic_u64_compare_and_store(
                    &self.next_free as *const u64 as *mut u64,
                    expected,
                    desired,
                )
            };
            if actual == expected {
                return expected;
            }
            expected = actual;
        }
    }

    /// Bump heaps reclaim nothing; freed space comes back when the shelf is
    /// destroyed.
    pub fn free(&self, _offset: Offset) {}

    pub fn is_valid(&self, offset: Offset) -> bool {
        if offset < METADATA_SIZE {
            return false;
        }
        offset - METADATA_SIZE < self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP: u64 = 64 * 1024;
    const AREA: usize = (METADATA_SIZE + HEAP) as usize;

    #[repr(C, align(64))]
    struct Area([u8; AREA]);

    #[test]
    fn test_create_verify_destroy() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        unsafe {
            assert!(!BumpLayout::verify(base));
            BumpLayout::create(base, HEAP);
            assert!(BumpLayout::verify(base));
            assert_eq!(BumpLayout::view(base).size(), HEAP);
            BumpLayout::destroy(base);
            assert!(!BumpLayout::verify(base));
        }
    }

    #[test]
    fn test_alloc_alignment_and_validity() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        unsafe { BumpLayout::create(base, HEAP) };
        let layout = unsafe { BumpLayout::view(base) };

        let a = layout.alloc(1);
        let b = layout.alloc(100);
        assert_eq!(a, METADATA_SIZE);
        assert_eq!(a % CACHE_LINE_SIZE as u64, 0);
        assert_eq!(b, a + 64);
        assert!(layout.is_valid(a));
        assert!(layout.is_valid(b));
        assert!(!layout.is_valid(0));
        assert!(!layout.is_valid(METADATA_SIZE - 8));
        assert!(!layout.is_valid(METADATA_SIZE + HEAP));
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut area = Box::new(Area([0; AREA]));
        let base = area.0.as_mut_ptr();
        unsafe { BumpLayout::create(base, HEAP) };
        let layout = unsafe { BumpLayout::view(base) };

        assert_eq!(layout.alloc(HEAP + 1), 0);
        let big = layout.alloc(HEAP);
        assert_eq!(big, METADATA_SIZE);
        // heap fully consumed now
        assert_eq!(layout.alloc(1), 0);
        // free is a no-op; the space does not come back
        layout.free(big);
        assert_eq!(layout.alloc(1), 0);
    }

    #[test]
    fn test_concurrent_alloc_disjoint() {
        use std::sync::Arc;
        struct SendArea(Box<Area>);
        unsafe impl Send for SendArea {}
        unsafe impl Sync for SendArea {}

        let mut area = Box::new(Area([0; AREA]));
        unsafe { BumpLayout::create(area.0.as_mut_ptr(), HEAP) };
        let shared = Arc::new(SendArea(area));

        let mut handles = vec![];
        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                let base = shared.0 .0.as_ptr() as *mut u8;
                let layout = unsafe { BumpLayout::view(base) };
                let mut offsets = vec![];
                for _ in 0..100 {
                    let off = layout.alloc(64);
                    if off != 0 {
                        offsets.push(off);
                    }
                }
                offsets
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "offsets must be disjoint");
    }
}
