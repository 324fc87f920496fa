// Raw region payload on one shelf
//
// A region shelf carries no allocator, just a magic-guarded header so Verify
// can tell a formatted region from stray bytes, followed by the raw payload
// callers map and slice up themselves. The header occupies one device page
// (mmap offsets must be page aligned), map offsets are payload relative, and
// the header page is never exposed.

use std::path::PathBuf;
use tracing::trace;

use crate::config::device_page_size;
use crate::error::{MmError, Result};
use crate::fam;
use crate::shelf_mgmt::shelf_file::ShelfFile;

const REGION_MAGIC: u64 = 764733104;

/// Bytes reserved for the header before the payload: one device page, so
/// payload map offsets stay page aligned.
fn header_size() -> u64 {
    device_page_size()
}

pub struct ShelfRegion {
    shelf: ShelfFile,
    is_open: bool,
}

impl ShelfRegion {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            shelf: ShelfFile::new(path.into()),
            is_open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Formats the shelf as a region of `size` payload bytes.
    pub fn create(&mut self, size: u64) -> Result<()> {
        debug_assert!(!self.is_open);
        if size == 0 {
            return Err(MmError::InvalidArgument("region size is zero".into()));
        }
        self.shelf.truncate(size + header_size())?;
        self.shelf.open(libc::O_RDWR)?;
        let base = self.shelf.map(
            std::ptr::null_mut(),
            header_size(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )?;
        // Safety: base maps the header line with no concurrent opener.
        unsafe {
            std::ptr::write_bytes(base, 0, header_size() as usize);
            fam::persist(base, header_size() as usize);
            fam::atomic_u64_write(base as *mut u64, REGION_MAGIC);
            fam::persist(base, header_size() as usize);
        }
        self.shelf.unmap(base, header_size(), false)?;
        self.shelf.close()?;
        trace!(path = %self.shelf.path().display(), size, "region shelf created");
        Ok(())
    }

    /// Clears the header and truncates the shelf to zero.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open);
        self.shelf.open(libc::O_RDWR)?;
        let base = self.shelf.map(
            std::ptr::null_mut(),
            header_size(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )?;
        // Safety: base maps the header line with no concurrent opener.
        unsafe {
            fam::atomic_u64_write(base as *mut u64, 0);
            fam::persist(base, header_size() as usize);
        }
        self.shelf.unmap(base, header_size(), false)?;
        self.shelf.close()?;
        self.shelf.truncate(0)
    }

    pub fn verify(&mut self) -> Result<bool> {
        debug_assert!(!self.is_open);
        self.shelf.open(libc::O_RDONLY)?;
        let base = self.shelf.map(
            std::ptr::null_mut(),
            header_size(),
            libc::PROT_READ,
            libc::MAP_SHARED,
            0,
            false,
        )?;
        // Safety: base maps the header line.
        let ok = unsafe { fam::atomic_u64_read(base as *const u64) == REGION_MAGIC };
        self.shelf.unmap(base, header_size(), false)?;
        self.shelf.close()?;
        Ok(ok)
    }

    pub fn open(&mut self, flags: libc::c_int) -> Result<()> {
        debug_assert!(!self.is_open);
        self.shelf.open(flags)?;
        self.is_open = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Err(MmError::ShelfFileClosed(
                self.shelf.path().display().to_string(),
            ));
        }
        self.shelf.close()?;
        self.is_open = false;
        Ok(())
    }

    /// Payload bytes available to map.
    pub fn size(&self) -> Result<u64> {
        Ok(self.shelf.size()?.saturating_sub(header_size()))
    }

    /// Maps `length` payload bytes starting at payload offset `offset`.
    pub fn map(
        &self,
        addr_hint: *mut libc::c_void,
        length: u64,
        prot: libc::c_int,
        flags: libc::c_int,
        offset: i64,
        ) -> Result<*mut u8> {
        self.shelf
            .map(addr_hint, length, prot, flags, offset + header_size() as i64, false)
    }

    pub fn unmap(&self, addr: *mut u8, length: u64) -> Result<()> {
        self.shelf.unmap(addr, length, false)
    }

    pub fn permission(&self) -> Result<u32> {
        self.shelf.permission()
    }

    pub fn set_permission(&self, mode: u32) -> Result<()> {
        self.shelf.set_permission(mode)
    }
}

impl Drop for ShelfRegion {
    fn drop(&mut self) {
        if self.is_open {
            let _ = self.close();
        }
    }
}
