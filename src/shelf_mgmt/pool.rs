// Pools
//
// A pool is a persistent set of shelves sharing one pool id. Membership
// lives in a small metadata shelf (`..._<pool>_0_pool`): a magic-guarded
// header recording the per-shelf size, the allocator's minimum allocation
// size, the file mode for new shelves, and a monotonically growing slot
// count; a fabric spinlock serializing directory edits across processes; and
// a bitmap with one bit per shelf index.
//
// Shelf sizes are fixed at pool creation. The set of shelf indices only
// grows while the pool is open for write; RemoveShelf clears a bit but never
// shrinks the slot count, so enumeration stays stable for every opener.

use std::path::PathBuf;
use tracing::{error, trace};

use crate::config::Config;
use crate::error::{MmError, Result};
use crate::fam::{self, FamSpinlock, CACHE_LINE_SIZE};
use crate::shelf_id::{PoolId, ShelfId, ShelfIndex};
use crate::shelf_mgmt::shelf_file::ShelfFile;
use crate::shelf_mgmt::shelf_name::ShelfName;

const POOL_MAGIC: u64 = 608209996;
const METADATA_SUFFIX: &str = "pool";

#[repr(C)]
struct PoolHeader {
    magic: u64,
    shelf_size: u64,
    min_alloc_size: u64,
    slot_count: u64,
    mode: u64,
    _pad0: [u8; CACHE_LINE_SIZE - 40],
    lock: FamSpinlock,
    membership: u64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
}

/// Callback installing the per-shelf payload (region header, heap layout)
/// after the shelf file exists but before the shelf is published.
pub type ShelfFormatFn<'a> = &'a mut dyn FnMut(&mut ShelfFile, u64) -> Result<()>;

pub struct Pool {
    pool_id: PoolId,
    shelf_name: ShelfName,
    metadata_path: PathBuf,
    metadata: Option<Mapped>,
}

struct Mapped {
    file: ShelfFile,
    base: *mut u8,
    length: u64,
}

// Safety: the mapped base points into a shared file mapping; all mutation of
// it goes through fam atomics or under the on-shelf spinlock.
unsafe impl Send for Pool {}

impl Pool {
    pub fn new(config: &Config, pool_id: PoolId) -> Self {
        let shelf_name = ShelfName::new(config);
        let metadata_path =
            shelf_name.path_with_suffix(ShelfId::new(pool_id, 0), METADATA_SUFFIX);
        Self {
            pool_id,
            shelf_name,
            metadata_path,
            metadata: None,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn is_open(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn exist(&self) -> bool {
        self.metadata_path.exists()
    }

    fn header(&self) -> Result<*mut PoolHeader> {
        match &self.metadata {
            Some(mapped) => Ok(mapped.base as *mut PoolHeader),
            None => Err(MmError::PoolFailed(format!(
                "pool {} is not open",
                self.pool_id
            ))),
        }
    }

    /// Creates the pool directory. `shelf_size` fixes the size of every
    /// future shelf; `min_alloc_size` selects and parameterizes the per-shelf
    /// allocator; `mode` is applied to every shelf file.
    pub fn create(&mut self, shelf_size: u64, min_alloc_size: u64, mode: u32) -> Result<()> {
        debug_assert!(!self.is_open());
        if shelf_size == 0 {
            return Err(MmError::InvalidArgument("shelf_size is zero".into()));
        }
        let mut file = ShelfFile::new(&self.metadata_path);
        match file.create(mode, std::mem::size_of::<PoolHeader>() as u64) {
            Ok(()) => {}
            Err(MmError::ShelfFileFound(_)) => return Err(MmError::PoolFound(self.pool_id)),
            Err(err) => return Err(err),
        }
        file.open(libc::O_RDWR)?;
        let length = file.size()?;
        let base = file.map(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )?;

        // format: fields first, magic last
        let header = base as *mut PoolHeader;
        // Safety: base covers at least one PoolHeader of fresh zero pages.
        unsafe {
            (*header).shelf_size = shelf_size;
            (*header).min_alloc_size = min_alloc_size;
            (*header).slot_count = 0;
            (*header).mode = mode as u64;
            (*header).membership = 0;
            fam::persist(base, length as usize);
            fam::atomic_u64_write(&mut (*header).magic, POOL_MAGIC);
            fam::persist(base, CACHE_LINE_SIZE);
        }

        file.unmap(base, length, false)?;
        file.close()?;
        trace!(pool = self.pool_id, shelf_size, "pool created");
        Ok(())
    }

    /// Tears the pool directory down. All shelves must have been removed.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.exist() {
            return Err(MmError::PoolNotFound(self.pool_id));
        }
        let mut file = ShelfFile::new(&self.metadata_path);
        file.open(libc::O_RDWR)?;
        let length = file.size()?;
        let base = file.map(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )?;
        let header = base as *mut PoolHeader;
        // Safety: the mapping covers the header.
        unsafe {
            if fam::atomic_u64_read(&(*header).magic) != POOL_MAGIC {
                file.unmap(base, length, false)?;
                file.close()?;
                return Err(MmError::PoolNotFound(self.pool_id));
            }
            if fam::atomic_u64_read(&(*header).membership) != 0 {
                file.unmap(base, length, false)?;
                file.close()?;
                return Err(MmError::PoolFailed(format!(
                    "pool {} still has shelves",
                    self.pool_id
                )));
            }
            // magic first, then the rest
            fam::atomic_u64_write(&mut (*header).magic, 0);
            fam::persist(base, CACHE_LINE_SIZE);
            std::ptr::write_bytes(base, 0, length as usize);
            fam::persist(base, length as usize);
        }
        file.unmap(base, length, false)?;
        file.close()?;
        file.truncate(0)?;
        file.destroy()?;
        trace!(pool = self.pool_id, "pool destroyed");
        Ok(())
    }

    /// Opens (maps) the pool directory. With `exclusive` the metadata file is
    /// flocked exclusively, keeping other processes out until close.
    pub fn open(&mut self, exclusive: bool) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.exist() {
            return Err(MmError::PoolNotFound(self.pool_id));
        }
        let mut file = ShelfFile::new(&self.metadata_path);
        file.open(libc::O_RDWR)?;
        if exclusive {
            let fd = file.raw_fd().expect("just opened");
            // Safety: fd is an open descriptor we own; the lock dies with it.
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let _ = file.close();
                return Err(MmError::PoolFailed(format!(
                    "pool {} is opened by another process",
                    self.pool_id
                )));
            }
        }
        let length = file.size()?;
        let base = file.map(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )?;
        let header = base as *const PoolHeader;
        // Safety: the mapping covers the header.
        let magic = unsafe { fam::atomic_u64_read(&(*header).magic) };
        if magic != POOL_MAGIC {
            error!(pool = self.pool_id, magic, "pool metadata magic mismatch");
            file.unmap(base, length, false)?;
            file.close()?;
            return Err(MmError::ShelfFileInvalidFormat(
                self.metadata_path.display().to_string(),
            ));
        }
        self.metadata = Some(Mapped { file, base, length });
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut mapped) = self.metadata.take() {
            mapped.file.unmap(mapped.base, mapped.length, false)?;
            mapped.file.close()?;
        }
        Ok(())
    }

    pub fn shelf_size(&self) -> Result<u64> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        Ok(unsafe { fam::read_u64(&(*header).shelf_size) })
    }

    pub fn min_alloc_size(&self) -> Result<u64> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        Ok(unsafe { fam::read_u64(&(*header).min_alloc_size) })
    }

    pub fn mode(&self) -> Result<u32> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        Ok(unsafe { fam::read_u64(&(*header).mode) } as u32)
    }

    /// Number of shelf slots ever allocated (grows monotonically; removed
    /// shelves leave holes).
    pub fn size(&self) -> Result<usize> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        Ok(unsafe { fam::atomic_u64_read(&(*header).slot_count) } as usize)
    }

    pub fn check_shelf(&self, shelf_idx: ShelfIndex) -> Result<bool> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        let bits = unsafe { fam::atomic_u64_read(&(*header).membership) };
        Ok(bits & (1u64 << shelf_idx) != 0)
    }

    pub fn get_shelf_path(&self, shelf_idx: ShelfIndex) -> PathBuf {
        self.shelf_name.path(ShelfId::new(self.pool_id, shelf_idx))
    }

    pub fn shelf_id(&self, shelf_idx: ShelfIndex) -> ShelfId {
        ShelfId::new(self.pool_id, shelf_idx)
    }

    /// Adds shelf `shelf_idx`: creates the backing file at the pool's shelf
    /// size, runs `format` to install the payload, then publishes the shelf
    /// by setting its membership bit. With `exclusive` an already-present
    /// shelf is an error; otherwise it is returned as success.
    pub fn add_shelf(
        &mut self,
        shelf_idx: ShelfIndex,
        format: ShelfFormatFn<'_>,
        exclusive: bool,
    ) -> Result<()> {
        if shelf_idx as usize >= ShelfId::MAX_SHELF_COUNT {
            return Err(MmError::InvalidArgument(format!(
                "shelf index {shelf_idx} out of range"
            )));
        }
        let header = self.header()?;
        let shelf_size = self.shelf_size()?;
        let mode = self.mode()?;
        let path = self.get_shelf_path(shelf_idx);
        let shelf_id = self.shelf_id(shelf_idx);

        // Safety: header points into the live metadata mapping; the on-shelf
        // spinlock serializes directory edits across processes.
        unsafe {
            (*header).lock.lock();
        }
        let result = (|| -> Result<()> {
            // Safety: as above, under the directory lock.
            let bits = unsafe { fam::atomic_u64_read(&(*header).membership) };
            if bits & (1u64 << shelf_idx) != 0 {
                if exclusive {
                    return Err(MmError::PoolFailed(format!(
                        "shelf {shelf_idx} already in pool {}",
                        self.pool_id
                    )));
                }
                return Ok(());
            }

            let mut shelf = ShelfFile::with_id(&path, shelf_id);
            if shelf.exist() {
                // leftover from a crashed add; the bit is clear so nobody
                // can hold a reference
                shelf.destroy()?;
            }
            shelf.create(mode, shelf_size)?;
            if let Err(err) = format(&mut shelf, shelf_size) {
                error!(pool = self.pool_id, shelf_idx, "shelf format failed");
                let _ = shelf.destroy();
                return Err(err);
            }

            // publish: membership bit, then the (monotone) slot count
            unsafe {
                fam::atomic_u64_write(&mut (*header).membership, bits | (1u64 << shelf_idx));
                let slots = fam::atomic_u64_read(&(*header).slot_count);
                if (shelf_idx as u64 + 1) > slots {
                    fam::atomic_u64_write(&mut (*header).slot_count, shelf_idx as u64 + 1);
                }
                fam::persist(header as *const u8, std::mem::size_of::<PoolHeader>());
            }
            trace!(pool = self.pool_id, shelf_idx, "shelf added");
            Ok(())
        })();
        // Safety: lock acquired above.
        unsafe {
            (*header).lock.unlock();
        }
        result
    }

    /// Unpublishes shelf `shelf_idx` and deletes its backing file.
    pub fn remove_shelf(&mut self, shelf_idx: ShelfIndex) -> Result<()> {
        let header = self.header()?;
        let path = self.get_shelf_path(shelf_idx);
        // Safety: header points into the live metadata mapping.
        unsafe {
            (*header).lock.lock();
        }
        let result = (|| -> Result<()> {
            // Safety: as above, under the directory lock.
            let bits = unsafe { fam::atomic_u64_read(&(*header).membership) };
            if bits & (1u64 << shelf_idx) == 0 {
                return Err(MmError::ShelfFileNotFound(path.display().to_string()));
            }
            unsafe {
                fam::atomic_u64_write(&mut (*header).membership, bits & !(1u64 << shelf_idx));
                fam::persist(header as *const u8, std::mem::size_of::<PoolHeader>());
            }
            let mut shelf = ShelfFile::new(&path);
            shelf.truncate(0)?;
            shelf.destroy()?;
            trace!(pool = self.pool_id, shelf_idx, "shelf removed");
            Ok(())
        })();
        // Safety: lock acquired above.
        unsafe {
            (*header).lock.unlock();
        }
        result
    }

    /// Reconciles membership with the backing files: clears bits whose file
    /// is missing and removes orphan files whose bit is clear. Invoked from
    /// destructive paths and crash recovery, never from plain open.
    pub fn recover(&mut self) -> Result<()> {
        let header = self.header()?;
        // Safety: header points into the live metadata mapping.
        unsafe {
            (*header).lock.lock();
        }
        let result = (|| -> Result<()> {
            for shelf_idx in 0..ShelfId::MAX_SHELF_COUNT as ShelfIndex {
                let path = self.get_shelf_path(shelf_idx);
                // Safety: under the directory lock.
                let bits = unsafe { fam::atomic_u64_read(&(*header).membership) };
                let published = bits & (1u64 << shelf_idx) != 0;
                let on_disk = path.exists();
                if published && !on_disk {
                    error!(pool = self.pool_id, shelf_idx, "published shelf lost its file");
                    unsafe {
                        fam::atomic_u64_write(
                            &mut (*header).membership,
                            bits & !(1u64 << shelf_idx),
                        );
                        fam::persist(header as *const u8, std::mem::size_of::<PoolHeader>());
                    }
                } else if !published && on_disk {
                    error!(pool = self.pool_id, shelf_idx, "removing orphan shelf file");
                    let mut shelf = ShelfFile::new(&path);
                    let _ = shelf.destroy();
                }
            }
            Ok(())
        })();
        // Safety: lock acquired above.
        unsafe {
            (*header).lock.unlock();
        }
        result
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), "test");
        (dir, config)
    }

    fn noop_format(_shelf: &mut ShelfFile, _size: u64) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_create_open_close_destroy() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 1);
        assert!(!pool.exist());
        pool.create(1 << 20, 0, 0o600).unwrap();
        assert!(pool.exist());
        assert!(matches!(
            pool.create(1 << 20, 0, 0o600),
            Err(MmError::PoolFound(1))
        ));

        pool.open(false).unwrap();
        assert_eq!(pool.shelf_size().unwrap(), 1 << 20);
        assert_eq!(pool.min_alloc_size().unwrap(), 0);
        assert_eq!(pool.size().unwrap(), 0);
        pool.close().unwrap();

        pool.destroy().unwrap();
        assert!(!pool.exist());
        assert!(matches!(pool.destroy(), Err(MmError::PoolNotFound(1))));
    }

    #[test]
    fn test_add_check_remove_shelf() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 2);
        pool.create(1 << 16, 0, 0o600).unwrap();
        pool.open(false).unwrap();

        let mut format = noop_format;
        pool.add_shelf(0, &mut format, false).unwrap();
        assert!(pool.check_shelf(0).unwrap());
        assert!(!pool.check_shelf(1).unwrap());
        assert_eq!(pool.size().unwrap(), 1);
        assert!(pool.get_shelf_path(0).exists());
        assert_eq!(pool.get_shelf_path(0).metadata().unwrap().len(), 1 << 16);

        // non-exclusive re-add tolerates the existing shelf
        pool.add_shelf(0, &mut format, false).unwrap();
        // exclusive re-add reports the conflict
        assert!(pool.add_shelf(0, &mut format, true).is_err());

        pool.add_shelf(3, &mut format, false).unwrap();
        assert_eq!(pool.size().unwrap(), 4);

        pool.remove_shelf(0).unwrap();
        assert!(!pool.check_shelf(0).unwrap());
        assert!(!pool.get_shelf_path(0).exists());
        // slot count never shrinks
        assert_eq!(pool.size().unwrap(), 4);

        pool.remove_shelf(3).unwrap();
        pool.close().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn test_destroy_refuses_with_shelves() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 3);
        pool.create(1 << 16, 0, 0o600).unwrap();
        pool.open(false).unwrap();
        let mut format = noop_format;
        pool.add_shelf(1, &mut format, false).unwrap();
        pool.close().unwrap();

        assert!(pool.destroy().is_err());

        pool.open(false).unwrap();
        pool.remove_shelf(1).unwrap();
        pool.close().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn test_format_failure_rolls_back() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 4);
        pool.create(1 << 16, 0, 0o600).unwrap();
        pool.open(false).unwrap();

        let mut failing = |_: &mut ShelfFile, _: u64| -> Result<()> {
            Err(MmError::InvalidArgument("boom".into()))
        };
        assert!(pool.add_shelf(2, &mut failing, false).is_err());
        assert!(!pool.check_shelf(2).unwrap());
        assert!(!pool.get_shelf_path(2).exists());

        pool.close().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn test_exclusive_open() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 6);
        pool.create(1 << 16, 0, 0o600).unwrap();

        let mut holder = Pool::new(&config, 6);
        holder.open(true).unwrap();

        // exclusive opens exclude each other; shared opens still pass
        let mut contender = Pool::new(&config, 6);
        assert!(matches!(contender.open(true), Err(MmError::PoolFailed(_))));
        contender.open(false).unwrap();
        contender.close().unwrap();

        holder.close().unwrap();
        contender.open(true).unwrap();
        contender.close().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn test_recover_reconciles() {
        let (_dir, config) = test_config();
        let mut pool = Pool::new(&config, 5);
        pool.create(1 << 16, 0, 0o600).unwrap();
        pool.open(false).unwrap();
        let mut format = noop_format;
        pool.add_shelf(0, &mut format, false).unwrap();
        pool.add_shelf(1, &mut format, false).unwrap();

        // simulate a crash: shelf 0's file vanishes, an orphan appears at 7
        std::fs::remove_file(pool.get_shelf_path(0)).unwrap();
        std::fs::write(pool.get_shelf_path(7), b"junk").unwrap();

        pool.recover().unwrap();
        assert!(!pool.check_shelf(0).unwrap());
        assert!(pool.check_shelf(1).unwrap());
        assert!(!pool.get_shelf_path(7).exists());

        pool.remove_shelf(1).unwrap();
        pool.close().unwrap();
        pool.destroy().unwrap();
    }
}
