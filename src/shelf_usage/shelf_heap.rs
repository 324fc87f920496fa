// Per-shelf heaps
//
// A ShelfHeap is the allocator living on one shelf file. The allocator
// itself is a capability with two implementations sharing one seam:
//
//  - the bump layout (the default, selected by `min_alloc_size == 0`):
//    monotone cursor, no reclamation;
//  - the zone layout (nonzero `min_alloc_size`): buddy chunks with
//    reclamation and crash recovery.
//
// Which one a shelf carries is decided at pool creation and re-detected at
// open from the on-shelf magic, so every opener agrees without consulting
// anything but the shelf itself.
//
// Open/close go through the process-local ShelfManager registry when the
// shelf has a valid id, so heaps and pointer translation share one mapping
// per shelf; create/verify/destroy use short-lived private maps because they
// must observe the shelf exclusively anyway.

use std::path::PathBuf;
use tracing::trace;

use crate::error::{MmError, Result};
use crate::global_ptr::Offset;
use crate::shelf_id::ShelfId;
use crate::shelf_mgmt::shelf_file::ShelfFile;
use crate::shelf_usage::bump_heap::{BumpLayout, METADATA_SIZE};
use crate::shelf_usage::zone::Zone;

/// The allocator seam shared by the bump and zone layouts.
trait ShelfAllocator: Send {
    fn alloc(&self, size: u64) -> Offset;
    fn free(&self, offset: Offset);
    fn is_valid_offset(&self, offset: Offset) -> bool;
    fn size(&self) -> u64;
    /// Local address of an offset this allocator handed out.
    fn offset_to_ptr(&self, offset: Offset) -> *mut u8;
}

struct BumpAllocator {
    base: *mut u8,
}

// Safety: the layout is mutated only through fam atomics.
unsafe impl Send for BumpAllocator {}

impl ShelfAllocator for BumpAllocator {
    fn alloc(&self, size: u64) -> Offset {
        // Safety: base maps a verified bump layout.
        unsafe { BumpLayout::view(self.base) }.alloc(size)
    }

    fn free(&self, offset: Offset) {
        // Safety: as above.
        unsafe { BumpLayout::view(self.base) }.free(offset)
    }

    fn is_valid_offset(&self, offset: Offset) -> bool {
        // Safety: as above.
        unsafe { BumpLayout::view(self.base) }.is_valid(offset)
    }

    fn size(&self) -> u64 {
        // Safety: as above.
        unsafe { BumpLayout::view(self.base) }.size()
    }

    fn offset_to_ptr(&self, offset: Offset) -> *mut u8 {
        // Safety: as above; bump offsets are plain displacements.
        unsafe { self.base.add(offset as usize) }
    }
}

struct ZoneAllocator {
    zone: Zone,
}

impl ShelfAllocator for ZoneAllocator {
    fn alloc(&self, size: u64) -> Offset {
        self.zone.alloc(size)
    }

    fn free(&self, offset: Offset) {
        self.zone.free(offset)
    }

    fn is_valid_offset(&self, offset: Offset) -> bool {
        self.zone.is_valid_offset(offset)
    }

    fn size(&self) -> u64 {
        self.zone.current_size()
    }

    fn offset_to_ptr(&self, offset: Offset) -> *mut u8 {
        self.zone.offset_to_ptr(offset)
    }
}

struct OpenHeap {
    base: *mut u8,
    mapped_len: u64,
    registered: bool,
    allocator: Box<dyn ShelfAllocator>,
}

pub struct ShelfHeap {
    shelf: ShelfFile,
    min_alloc_size: u64,
    state: Option<OpenHeap>,
}

// Safety: the mapped base moves with the heap and all allocator state on it
// is only touched through fam atomics.
unsafe impl Send for ShelfHeap {}

impl ShelfHeap {
    /// `min_alloc_size` selects the allocator installed by `create`:
    /// 0 for the bump layout, nonzero for the zone layout with that minimum
    /// chunk size. Opening re-detects the layout from the shelf.
    pub fn new(path: impl Into<PathBuf>, shelf_id: ShelfId, min_alloc_size: u64) -> Self {
        Self {
            shelf: ShelfFile::with_id(path.into(), shelf_id),
            min_alloc_size,
            state: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn map_raw(&mut self) -> Result<(*mut u8, u64)> {
        if !self.shelf.exist() {
            return Err(MmError::ShelfFileNotFound(
                self.shelf.path().display().to_string(),
            ));
        }
        self.shelf.open(libc::O_RDWR)?;
        let len = self.shelf.size()?;
        match self.shelf.map(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            true,
        ) {
            Ok(base) => Ok((base, len)),
            Err(err) => {
                let _ = self.shelf.close();
                Err(err)
            }
        }
    }

    fn unmap_raw(&mut self, base: *mut u8, len: u64) -> Result<()> {
        self.shelf.unmap(base, len, true)?;
        self.shelf.close()
    }

    /// Formats the shelf for `heap_size` payload bytes. The shelf file must
    /// already exist; it is truncated to fit the layout.
    pub fn create(&mut self, heap_size: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        let total = if self.min_alloc_size == 0 {
            heap_size + METADATA_SIZE
        } else {
            heap_size
        };
        self.shelf.truncate(total)?;
        let (base, len) = self.map_raw()?;
        // Safety: base maps len >= total bytes with no concurrent opener.
        let ret = unsafe {
            if self.min_alloc_size == 0 {
                BumpLayout::create(base, heap_size);
                Ok(())
            } else {
                match Zone::create(base, heap_size / 4, self.min_alloc_size, len) {
                    Some(_) => Ok(()),
                    None => Err(MmError::HeapCreateFailed(format!(
                        "zone does not fit in {len} bytes"
                    ))),
                }
            }
        };
        self.unmap_raw(base, len)?;
        ret
    }

    /// Clears the layout and truncates the shelf to zero.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        let (base, len) = self.map_raw()?;
        // Safety: base maps the full shelf with no concurrent opener.
        unsafe {
            if BumpLayout::verify(base) {
                BumpLayout::destroy(base);
            } else {
                // zones clear magic the same way; zero the first line
                crate::fam::atomic_u64_write(base as *mut u64, 0);
                crate::fam::persist(base, crate::fam::CACHE_LINE_SIZE);
            }
        }
        self.unmap_raw(base, len)?;
        self.shelf.truncate(0)
    }

    /// Whether the shelf carries a well-formed heap layout of either kind.
    pub fn verify(&mut self) -> Result<bool> {
        debug_assert!(!self.is_open());
        let (base, len) = self.map_raw()?;
        // Safety: base maps at least one cache line.
        let ok = unsafe { BumpLayout::verify(base) || Zone::verify(base) };
        self.unmap_raw(base, len)?;
        Ok(ok)
    }

    /// Completes any interrupted allocator transition. Opening a zone runs
    /// its crash recovery as a side effect; bump layouts have nothing to
    /// recover.
    pub fn recover(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.open()?;
        self.close()
    }

    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        self.shelf.open(libc::O_RDWR)?;
        let len = self.shelf.size()?;
        if len < crate::fam::CACHE_LINE_SIZE as u64 {
            let _ = self.shelf.close();
            return Err(MmError::ShelfFileInvalidFormat(
                self.shelf.path().display().to_string(),
            ));
        }
        let registered = self.shelf.shelf_id().is_valid();
        let base = if registered {
            match self.shelf.map_registered() {
                Ok(base) => base,
                Err(err) => {
                    let _ = self.shelf.close();
                    return Err(err);
                }
            }
        } else {
            match self.shelf.map(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                0,
                true,
            ) {
                Ok(base) => base,
                Err(err) => {
                    let _ = self.shelf.close();
                    return Err(err);
                }
            }
        };

        // Safety: base maps the whole shelf.
        let allocator: Option<Box<dyn ShelfAllocator>> = unsafe {
            if BumpLayout::verify(base) {
                Some(Box::new(BumpAllocator { base }))
            } else if Zone::verify(base) {
                Zone::open(base, len).map(|zone| Box::new(ZoneAllocator { zone }) as Box<_>)
            } else {
                None
            }
        };
        match allocator {
            Some(allocator) => {
                self.state = Some(OpenHeap {
                    base,
                    mapped_len: len,
                    registered,
                    allocator,
                });
                trace!(path = %self.shelf.path().display(), "shelf heap opened");
                Ok(())
            }
            None => {
                if registered {
                    let _ = self.shelf.unmap_registered(base, false);
                } else {
                    let _ = self.shelf.unmap(base, len, true);
                }
                let _ = self.shelf.close();
                Err(MmError::ShelfFileInvalidFormat(
                    self.shelf.path().display().to_string(),
                ))
            }
        }
    }

    pub fn close(&mut self) -> Result<()> {
        let state = self.state.take().ok_or_else(|| {
            MmError::ShelfFileClosed(self.shelf.path().display().to_string())
        })?;
        if state.registered {
            self.shelf.unmap_registered(state.base, false)?;
        } else {
            self.shelf.unmap(state.base, state.mapped_len, true)?;
        }
        self.shelf.close()
    }

    fn allocator(&self) -> Result<&dyn ShelfAllocator> {
        self.state
            .as_ref()
            .map(|s| s.allocator.as_ref())
            .ok_or_else(|| MmError::ShelfFileClosed(self.shelf.path().display().to_string()))
    }

    pub fn size(&self) -> Result<u64> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| MmError::ShelfFileClosed(self.shelf.path().display().to_string()))?;
        let size = state.allocator.size();
        Ok(if size != 0 { size } else { state.mapped_len })
    }

    /// Allocates from this shelf; 0 on exhaustion.
    pub fn alloc(&self, size: u64) -> Result<Offset> {
        let offset = self.allocator()?.alloc(size);
        trace!(path = %self.shelf.path().display(), size, offset, "shelf alloc");
        Ok(offset)
    }

    pub fn free(&self, offset: Offset) -> Result<()> {
        self.allocator()?.free(offset);
        trace!(path = %self.shelf.path().display(), offset, "shelf free");
        Ok(())
    }

    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        self.allocator()
            .map(|a| a.is_valid_offset(offset))
            .unwrap_or(false)
    }

    pub fn offset_to_ptr(&self, offset: Offset) -> Result<*mut u8> {
        let allocator = self.allocator()?;
        if !allocator.is_valid_offset(offset) {
            return Err(MmError::InvalidArgument(format!(
                "offset {offset:#x} is not valid on this shelf"
            )));
        }
        Ok(allocator.offset_to_ptr(offset))
    }

    pub fn ptr_to_offset(&self, addr: *const u8) -> Result<Offset> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| MmError::ShelfFileClosed(self.shelf.path().display().to_string()))?;
        if (addr as usize) < (state.base as usize) {
            return Err(MmError::InvalidArgument("pointer below shelf base".into()));
        }
        let offset = addr as u64 - state.base as u64;
        if !state.allocator.is_valid_offset(offset) {
            return Err(MmError::InvalidArgument(format!(
                "pointer {addr:p} is not inside this shelf's heap"
            )));
        }
        Ok(offset)
    }
}

impl Drop for ShelfHeap {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    fn make_shelf(path: &PathBuf) {
        let mut file = ShelfFile::new(path);
        file.create(0o600, 0).unwrap();
    }

    #[test]
    fn test_bump_heap_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = heap_file(&dir, "heap_bump");
        make_shelf(&path);

        let mut heap = ShelfHeap::new(&path, ShelfId::INVALID, 0);
        heap.create(1 << 20).unwrap();
        assert!(heap.verify().unwrap());

        heap.open().unwrap();
        let a = heap.alloc(4).unwrap();
        assert!(a != 0);
        assert!(heap.is_valid_offset(a));
        assert_eq!(a % 64, 0);

        // write through the local pointer, reopen, and read it back
        let ptr = heap.offset_to_ptr(a).unwrap();
        unsafe { std::ptr::write_volatile(ptr as *mut u64, 42) };
        heap.close().unwrap();
        heap.open().unwrap();
        let ptr = heap.offset_to_ptr(a).unwrap();
        assert_eq!(unsafe { std::ptr::read_volatile(ptr as *const u64) }, 42);

        assert_eq!(heap.ptr_to_offset(ptr).unwrap(), a);
        heap.close().unwrap();
        heap.destroy().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_zone_heap_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = heap_file(&dir, "heap_zone");
        make_shelf(&path);

        let mut heap = ShelfHeap::new(&path, ShelfId::INVALID, 64);
        heap.create(1 << 20).unwrap();
        assert!(heap.verify().unwrap());

        heap.open().unwrap();
        let a = heap.alloc(200).unwrap();
        assert!(a != 0);
        assert!(heap.is_valid_offset(a));
        // zone frees actually reclaim
        heap.free(a).unwrap();
        let b = heap.alloc(200).unwrap();
        assert!(b != 0);
        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn test_open_detects_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = heap_file(&dir, "heap_detect");
        make_shelf(&path);

        // created as a zone, opened by a handle constructed for bump
        let mut creator = ShelfHeap::new(&path, ShelfId::INVALID, 128);
        creator.create(1 << 18).unwrap();

        let mut opener = ShelfHeap::new(&path, ShelfId::INVALID, 0);
        opener.open().unwrap();
        let off = opener.alloc(64).unwrap();
        assert!(off != 0);
        opener.free(off).unwrap();
        opener.close().unwrap();
    }

    #[test]
    fn test_unformatted_shelf_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = heap_file(&dir, "heap_raw");
        let mut file = ShelfFile::new(&path);
        file.create(0o600, 1 << 16).unwrap();

        let mut heap = ShelfHeap::new(&path, ShelfId::INVALID, 0);
        assert!(matches!(
            heap.open(),
            Err(MmError::ShelfFileInvalidFormat(_))
        ));
    }

    #[test]
    fn test_offsets_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = heap_file(&dir, "heap_valid");
        make_shelf(&path);
        let mut heap = ShelfHeap::new(&path, ShelfId::INVALID, 0);
        heap.create(1 << 16).unwrap();
        heap.open().unwrap();
        assert!(!heap.is_valid_offset(0));
        assert!(heap.offset_to_ptr(0).is_err());
        assert!(heap.offset_to_ptr(1 << 40).is_err());
        heap.close().unwrap();
    }
}
