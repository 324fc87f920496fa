// Shelf files
//
// A shelf is a named file on the shared backing store. This type wraps the
// file lifecycle (create, destroy, truncate, rename, open, close,
// permissions) and the two mapping paths:
//
//  - raw maps of an arbitrary range, optionally registered with the fabric
//    atomic subsystem (required before 128-bit operations on most hardware);
//  - whole-file maps that cooperate with the process-local ShelfManager
//    registry so one process maps each shelf exactly once.
//
// A ShelfFile never owns a mapping; it holds only its path and id, and asks
// the ShelfManager to establish or find shared mappings. That keeps the
// registry the single authority over what is mapped where.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{error, trace};

use crate::config::device_page_size;
use crate::error::{MmError, Result};
use crate::fam;
use crate::shelf_id::ShelfId;
use crate::shelf_mgmt::shelf_manager::ShelfManager;

/// Permission bits preserved by get/set permission.
const PERM_MASK: u32 = 0o777;

pub struct ShelfFile {
    path: PathBuf,
    shelf_id: ShelfId,
    file: Option<File>,
    page_size: u64,
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| MmError::InvalidArgument(format!("path contains NUL: {}", path.display())))
}

impl ShelfFile {
    /// A shelf file outside any pool (root and epoch shelves).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shelf_id: ShelfId::INVALID,
            file: None,
            page_size: device_page_size(),
        }
    }

    /// A pool shelf; the id enables the ShelfManager-cooperating map path.
    pub fn with_id(path: impl Into<PathBuf>, shelf_id: ShelfId) -> Self {
        Self {
            path: path.into(),
            shelf_id,
            file: None,
            page_size: device_page_size(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shelf_id(&self) -> ShelfId {
        self.shelf_id
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.file.as_ref().map(|file| file.as_raw_fd())
    }

    pub fn exist(&self) -> bool {
        self.path.exists()
    }

    /// File length; via the open descriptor when open, via the path otherwise.
    pub fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(std::fs::metadata(&self.path)?.len()),
        }
    }

    /// Creates the file with `mode`, then truncates to `size` if nonzero.
    /// The file is left closed.
    pub fn create(&mut self, mode: u32, size: u64) -> Result<()> {
        if self.exist() {
            return Err(MmError::ShelfFileFound(self.path.display().to_string()));
        }
        if self.is_open() {
            return Err(MmError::ShelfFileOpened(self.path.display().to_string()));
        }
        let cpath = path_cstring(&self.path)?;
        // Safety: cpath is a valid NUL-terminated path.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, mode as libc::mode_t) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return if err.raw_os_error() == Some(libc::EEXIST) {
                Err(MmError::ShelfFileFound(self.path.display().to_string()))
            } else {
                Err(MmError::ShelfFileCreateFailed(format!(
                    "{}: {err}",
                    self.path.display()
                )))
            };
        }
        // Safety: fd is a fresh descriptor we own.
        let file = unsafe { File::from_raw_fd(fd) };
        // re-apply the permissions so the process umask cannot narrow them
        use std::os::unix::fs::PermissionsExt;
        let _ = file.set_permissions(std::fs::Permissions::from_mode(mode & PERM_MASK));
        self.file = Some(file);
        let ret = if size > 0 { self.truncate(size) } else { Ok(()) };
        let _ = self.close();
        ret
    }

    /// Unlinks the file. Tolerates the file vanishing underneath (a racing
    /// destroyer), but refuses while the local handle is still open.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(MmError::ShelfFileOpened(self.path.display().to_string()));
        }
        let existed = self.exist();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(MmError::Io(err)),
        }
        if existed {
            Ok(())
        } else {
            Err(MmError::ShelfFileNotFound(self.path.display().to_string()))
        }
    }

    /// Sets the file length to `len` rounded up to the device page size.
    /// May be called opened or closed.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let len = fam::round_up(len, self.page_size);
        let rc = match &self.file {
            Some(file) => {
                // Safety: the descriptor is owned and open.
                unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) }
            }
            None => {
                let cpath = path_cstring(&self.path)?;
                // Safety: cpath is a valid NUL-terminated path.
                unsafe { libc::truncate(cpath.as_ptr(), len as libc::off_t) }
            }
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Err(MmError::ShelfFileNotFound(self.path.display().to_string()))
        } else {
            Err(MmError::ShelfFileTruncateFailed(format!(
                "{}: {err}",
                self.path.display()
            )))
        }
    }

    pub fn rename(&mut self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        std::fs::rename(&self.path, &new_path).map_err(|err| {
            MmError::ShelfFileRenameFailed(format!("{}: {err}", self.path.display()))
        })?;
        self.path = new_path;
        Ok(())
    }

    /// Opens with open(2) flags (`O_RDONLY`, `O_RDWR`, ...). Errors with
    /// `ShelfFileOpened` if already open in this handle.
    pub fn open(&mut self, flags: libc::c_int) -> Result<()> {
        if self.is_open() {
            return Err(MmError::ShelfFileOpened(self.path.display().to_string()));
        }
        if !self.exist() {
            return Err(MmError::ShelfFileNotFound(self.path.display().to_string()));
        }
        let cpath = path_cstring(&self.path)?;
        // Safety: cpath is a valid NUL-terminated path.
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd >= 0 {
            // Safety: fd is a fresh descriptor we own.
            self.file = Some(unsafe { File::from_raw_fd(fd) });
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Err(MmError::ShelfFileNotFound(self.path.display().to_string()))
        } else {
            Err(MmError::ShelfFileOpenFailed(format!(
                "{}: {err}",
                self.path.display()
            )))
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.file.take().is_none() {
            return Err(MmError::ShelfFileClosed(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Maps `length` bytes at `offset`, rounded up to the device page size.
    /// With `register_atomic` the range is also registered with the fabric
    /// atomic subsystem; [`Self::unmap_raw`] must then unregister it.
    pub fn map(
        &self,
        addr_hint: *mut libc::c_void,
        length: u64,
        prot: libc::c_int,
        flags: libc::c_int,
        offset: i64,
        register_atomic: bool,
    ) -> Result<*mut u8> {
        let file = self.file.as_ref().ok_or_else(|| {
            MmError::ShelfFileClosed(self.path.display().to_string())
        })?;
        let length = fam::round_up_nonzero(length, self.page_size) as usize;
        // Safety: fd is open; the kernel validates the rest.
        let addr = unsafe {
            libc::mmap(
                addr_hint,
                length,
                prot,
                flags,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MmError::ShelfFileMapFailed(format!(
                "{}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            )));
        }
        let addr = addr as *mut u8;
        if register_atomic {
            if let Err(err) = fam::register_region(addr, length) {
                error!(path = %self.path.display(), "atomic region registration failed");
                // Safety: we just mapped this exact range.
                unsafe { libc::munmap(addr as *mut libc::c_void, length) };
                return Err(err);
            }
        }
        trace!(path = %self.path.display(), addr = ?addr, length, "mapped shelf range");
        Ok(addr)
    }

    /// Unmaps a range produced by [`Self::map`]; must unregister iff the map
    /// registered.
    pub fn unmap(&self, addr: *mut u8, length: u64, unregister_atomic: bool) -> Result<()> {
        Self::unmap_raw(addr, length, unregister_atomic, self.page_size)
    }

    pub fn unmap_raw(
        addr: *mut u8,
        length: u64,
        unregister_atomic: bool,
        page_size: u64,
    ) -> Result<()> {
        let length = fam::round_up_nonzero(length, page_size) as usize;
        if unregister_atomic {
            fam::unregister_region(addr, length);
        }
        // Safety: caller passes a range previously returned by mmap.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, length) };
        if rc == 0 {
            Ok(())
        } else {
            Err(MmError::ShelfFileUnmapFailed(format!(
                "{:p}+{length}: {}",
                addr,
                std::io::Error::last_os_error()
            )))
        }
    }

    /// Whole-file map through the ShelfManager registry: if the shelf is
    /// already mapped in this process the existing base is returned and the
    /// refcount bumped; otherwise the file is mapped, registered for fabric
    /// atomics, and recorded.
    pub fn map_registered(&mut self) -> Result<*mut u8> {
        debug_assert!(self.shelf_id.is_valid());
        if !self.is_open() {
            return Err(MmError::ShelfFileClosed(self.path.display().to_string()));
        }
        let length = self.size()?;
        ShelfManager::global().open_or_register(self.shelf_id, length as usize, || {
            let addr = self.map(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                0,
                true,
            )?;
            Ok(addr)
        })
    }

    /// Symmetric close of a registry-held mapping. With `unregister` the
    /// mapping is dropped outright; otherwise only the refcount falls, and
    /// the real unmap happens when the last user leaves.
    pub fn unmap_registered(&mut self, addr: *mut u8, unregister: bool) -> Result<()> {
        debug_assert!(self.shelf_id.is_valid());
        let page_size = self.page_size;
        let removed = if unregister {
            ShelfManager::global().unregister_shelf(self.shelf_id)
        } else {
            ShelfManager::global().close_shelf(self.shelf_id)
        };
        match removed {
            Some((base, length)) => {
                debug_assert_eq!(base, addr as usize);
                Self::unmap_raw(base as *mut u8, length as u64, true, page_size)
            }
            None => Ok(()),
        }
    }

    /// Poison this shelf's registry entry after a detected failure.
    pub fn mark_invalid(&self) -> Result<()> {
        ShelfManager::global().mark_invalid(self.shelf_id)
    }

    pub fn is_invalid(&self) -> bool {
        ShelfManager::global().is_invalid(self.shelf_id)
    }

    pub fn permission(&self) -> Result<u32> {
        let meta = std::fs::metadata(&self.path).map_err(|err| {
            MmError::ShelfFileGetPermFailed(format!("{}: {err}", self.path.display()))
        })?;
        use std::os::unix::fs::PermissionsExt;
        Ok(meta.permissions().mode() & PERM_MASK)
    }

    pub fn set_permission(&self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode & PERM_MASK))
            .map_err(|err| {
                MmError::ShelfFileSetPermFailed(format!("{}: {err}", self.path.display()))
            })
    }
}

impl Drop for ShelfFile {
    fn drop(&mut self) {
        // the File closes itself; nothing else is owned here
        self.file.take();
    }
}
