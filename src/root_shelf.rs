// Root shelf
//
// The one well-known shelf every process of a namespace maps first. It is a
// fixed 128 MiB file holding, after the magic line: one fabric spinlock per
// pool id, one pool-type entry per pool id, the 16-bit region-id bitmap, and
// four root global pointers reserved for metadata and address-translation
// dictionaries. The MemoryManager lays those areas out; this type only owns
// the file lifecycle and the mapping.

use std::path::PathBuf;
use tracing::error;

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};
use crate::shelf_mgmt::shelf_file::ShelfFile;

const ROOT_MAGIC: u64 = 766874353;

/// Fixed size of the root shelf.
pub const ROOT_SHELF_SIZE: u64 = 128 * 1024 * 1024;

pub struct RootShelf {
    file: ShelfFile,
    base: Option<*mut u8>,
}

// Safety: the mapping is only touched through fam atomics, and the shared
// accessors take &self; lifecycle methods require &mut.
unsafe impl Send for RootShelf {}
unsafe impl Sync for RootShelf {}

impl RootShelf {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: ShelfFile::new(path.into()),
            base: None,
        }
    }

    pub fn exist(&self) -> bool {
        self.file.exist()
    }

    pub fn is_open(&self) -> bool {
        self.base.is_some()
    }

    pub fn create(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        self.file.create(0o666, ROOT_SHELF_SIZE)?;
        self.file.open(libc::O_RDWR)?;
        let base = match self.file.map(
            std::ptr::null_mut(),
            ROOT_SHELF_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        ) {
            Ok(base) => base,
            Err(err) => {
                let _ = self.file.close();
                return Err(err);
            }
        };
        // the file is fresh zeros; publishing is just the magic
        // Safety: base maps the whole shelf with no concurrent opener.
        unsafe {
            fam::atomic_u64_write(base as *mut u64, ROOT_MAGIC);
            fam::persist(base, CACHE_LINE_SIZE);
        }
        self.file.unmap(base, ROOT_SHELF_SIZE, false)?;
        self.file.close()
    }

    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        self.file.open(libc::O_RDWR)?;
        let base = match self.file.map(
            std::ptr::null_mut(),
            CACHE_LINE_SIZE as u64,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        ) {
            Ok(base) => base,
            Err(err) => {
                let _ = self.file.close();
                return Err(err);
            }
        };
        // Safety: base maps the magic line with no concurrent opener.
        unsafe {
            fam::atomic_u64_write(base as *mut u64, 0);
            fam::persist(base, CACHE_LINE_SIZE);
        }
        self.file.unmap(base, CACHE_LINE_SIZE as u64, false)?;
        self.file.close()?;
        self.file.truncate(0)?;
        self.file.destroy()
    }

    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        self.file.open(libc::O_RDWR)?;
        let base = match self.file.map(
            std::ptr::null_mut(),
            ROOT_SHELF_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            true,
        ) {
            Ok(base) => base,
            Err(err) => {
                let _ = self.file.close();
                return Err(err);
            }
        };
        // Safety: base maps at least the magic line.
        let magic = unsafe { fam::atomic_u64_read(base as *const u64) };
        if magic != ROOT_MAGIC {
            error!(path = %self.file.path().display(), magic, "root shelf magic mismatch");
            let _ = self.file.unmap(base, ROOT_SHELF_SIZE, true);
            let _ = self.file.close();
            return Err(MmError::ShelfFileInvalidFormat(
                self.file.path().display().to_string(),
            ));
        }
        self.base = Some(base);
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let base = self.base.take().ok_or_else(|| {
            MmError::ShelfFileClosed(self.file.path().display().to_string())
        })?;
        self.file.unmap(base, ROOT_SHELF_SIZE, true)?;
        self.file.close()
    }

    /// First usable byte after the magic line.
    pub fn addr(&self) -> Option<*mut u8> {
        // Safety: the payload begins one cache line past the mapped base.
        self.base.map(|base| unsafe { base.add(CACHE_LINE_SIZE) })
    }
}

impl Drop for RootShelf {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
