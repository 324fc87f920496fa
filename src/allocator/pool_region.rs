// Regions: raw mapped byte ranges identified by a pool id
//
// A region occupies a one-shelf pool: shelf 0 carries the ShelfRegion
// payload, and the pool directory exists so regions and heaps share the same
// id space, naming, and lifecycle plumbing.

use tracing::{error, trace};

use crate::config::Config;
use crate::error::{MmError, Result};
use crate::shelf_id::{PoolId, ShelfIndex};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_usage::shelf_region::ShelfRegion;

/// The single shelf a region pool uses.
const REGION_SHELF_IDX: ShelfIndex = 0;

pub struct PoolRegion {
    pool_id: PoolId,
    pool: Pool,
    size: u64,
    region: Option<ShelfRegion>,
}

impl PoolRegion {
    pub fn new(config: &Config, pool_id: PoolId) -> Self {
        Self {
            pool_id,
            pool: Pool::new(config, pool_id),
            size: 0,
            region: None,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn is_open(&self) -> bool {
        self.region.is_some()
    }

    pub fn exist(&self) -> bool {
        self.pool.exist()
    }

    pub fn create(&mut self, size: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        if size == 0 {
            return Err(MmError::InvalidArgument("region size is zero".into()));
        }
        if self.pool.exist() {
            return Err(MmError::PoolFound(self.pool_id));
        }
        self.pool.create(size, 0, 0o666)?;
        self.pool.open(false)?;
        let mut format = |shelf: &mut crate::shelf_mgmt::shelf_file::ShelfFile,
                          shelf_size: u64|
         -> Result<()> {
            let mut region = ShelfRegion::new(shelf.path());
            region.create(shelf_size)
        };
        let added = self.pool.add_shelf(REGION_SHELF_IDX, &mut format, false);
        if let Err(err) = added {
            error!(pool = self.pool_id, "region shelf creation failed");
            let _ = self.pool.close();
            let _ = self.pool.destroy();
            return Err(MmError::RegionCreateFailed(err.to_string()));
        }
        self.pool.close()?;
        trace!(pool = self.pool_id, size, "region created");
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.pool.exist() {
            return Err(MmError::PoolNotFound(self.pool_id));
        }
        self.pool.open(false)?;
        // reconcile membership with backing files before deleting anything
        if let Err(err) = self.pool.recover() {
            error!(pool = self.pool_id, error = %err, "region recovery found inconsistency");
        }
        let slots = self.pool.size()?;
        for shelf_idx in 0..slots as ShelfIndex {
            if self.pool.check_shelf(shelf_idx)? {
                if let Err(err) = self.pool.remove_shelf(shelf_idx) {
                    let _ = self.pool.close();
                    return Err(MmError::RegionDestroyFailed(err.to_string()));
                }
            }
        }
        self.pool.close()?;
        self.pool
            .destroy()
            .map_err(|err| MmError::RegionDestroyFailed(err.to_string()))?;
        trace!(pool = self.pool_id, "region destroyed");
        Ok(())
    }

    pub fn open(&mut self, flags: libc::c_int) -> Result<()> {
        debug_assert!(!self.is_open());
        self.pool
            .open(false)
            .map_err(|err| MmError::RegionOpenFailed(err.to_string()))?;
        let path = self.pool.get_shelf_path(REGION_SHELF_IDX);
        let mut region = ShelfRegion::new(&path);
        if let Err(err) = region.open(flags) {
            let _ = self.pool.close();
            return Err(MmError::RegionOpenFailed(err.to_string()));
        }
        self.size = region.size().unwrap_or(0);
        self.region = Some(region);
        trace!(pool = self.pool_id, "region opened");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let mut region = match self.region.take() {
            Some(region) => region,
            None => return Ok(()),
        };
        region
            .close()
            .map_err(|err| MmError::RegionCloseFailed(err.to_string()))?;
        self.pool
            .close()
            .map_err(|err| MmError::RegionCloseFailed(err.to_string()))?;
        self.size = 0;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn map(
        &self,
        addr_hint: *mut libc::c_void,
        length: u64,
        prot: libc::c_int,
        flags: libc::c_int,
        offset: i64,
    ) -> Result<*mut u8> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| MmError::RegionMapFailed("region is not open".into()))?;
        region
            .map(addr_hint, length, prot, flags, offset)
            .map_err(|err| MmError::RegionMapFailed(err.to_string()))
    }

    pub fn unmap(&self, addr: *mut u8, length: u64) -> Result<()> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| MmError::RegionUnmapFailed("region is not open".into()))?;
        region
            .unmap(addr, length)
            .map_err(|err| MmError::RegionUnmapFailed(err.to_string()))
    }
}

impl Drop for PoolRegion {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
