// Epoch shelf
//
// A small fixed-size shelf holding the EpochVector that all participants of
// a namespace share. Like the root shelf it is created once, mapped by every
// process, and guarded by a magic line; the vector itself starts one cache
// line in.

use std::path::PathBuf;
use tracing::error;

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};
use crate::shelf_mgmt::shelf_file::ShelfFile;

const EPOCH_MAGIC: u64 = 517772327;

/// Fixed size of the epoch shelf; comfortably holds the vector.
pub const EPOCH_SHELF_SIZE: u64 = 1024 * 1024;

pub struct EpochShelf {
    file: ShelfFile,
    base: Option<*mut u8>,
}

// Safety: the mapping is only touched through fam atomics.
unsafe impl Send for EpochShelf {}

impl EpochShelf {
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
        self.file.create(0o666, EPOCH_SHELF_SIZE)?;
        self.file.open(libc::O_RDWR)?;
        let base = match self.file.map(
            std::ptr::null_mut(),
            EPOCH_SHELF_SIZE,
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
        // Safety: base maps the whole fresh shelf.
        unsafe {
            fam::atomic_u64_write(base as *mut u64, EPOCH_MAGIC);
            fam::persist(base, CACHE_LINE_SIZE);
        }
        self.file.unmap(base, EPOCH_SHELF_SIZE, false)?;
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
            EPOCH_SHELF_SIZE,
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
        if magic != EPOCH_MAGIC {
            error!(path = %self.file.path().display(), magic, "epoch shelf magic mismatch");
            let _ = self.file.unmap(base, EPOCH_SHELF_SIZE, true);
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
        self.file.unmap(base, EPOCH_SHELF_SIZE, true)?;
        self.file.close()
    }

    /// Start of the EpochVector.
    pub fn addr(&self) -> Option<*mut u8> {
        // Safety: the vector begins one cache line past the mapped base.
        self.base.map(|base| unsafe { base.add(CACHE_LINE_SIZE) })
    }
}

impl Drop for EpochShelf {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epoch");
        let mut shelf = EpochShelf::new(&path);
        shelf.create().unwrap();
        shelf.open().unwrap();
        assert!(shelf.addr().is_some());
        shelf.close().unwrap();
        shelf.destroy().unwrap();
        assert!(!shelf.exist());
    }
}
