// Ownership table
//
// Grants a single process exclusive write access to a shelf's allocator
// state. Each slot is a 16-byte ProcessID cell flipped between zero and an
// owner identity with 128-bit compare-and-store, so acquisition is one
// atomic instruction visible to every process on the fabric.
//
// A slot holding a ProcessID whose process died can be revoked by anyone:
// either cleared outright, or stolen long enough to run a recovery function
// over the orphaned shelf and then released. A failed recovery writes the
// dead owner back so another process may retry.
//
// Layout (offsets from the area base):
//   [0..64)   header { magic, size, item_count }
//   [64..)    item_count 16-byte ProcessID cells

use tracing::{info, trace, warn};

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};
use crate::process_id::ProcessID;
use crate::shelf_id::ShelfIndex;

const OWNERSHIP_MAGIC: u64 = 696377447;

#[repr(C)]
struct OwnershipHeader {
    magic: u64,
    size: u64,
    item_count: u64,
}

struct OpenState {
    size: u64,
    item_count: u64,
    pid: ProcessID,
}

pub struct Ownership {
    base: *mut u8,
    avail_size: u64,
    state: Option<OpenState>,
}

// Safety: all mutation of the shared area goes through fam atomics.
unsafe impl Send for Ownership {}

fn header_size() -> u64 {
    fam::round_up(
        std::mem::size_of::<OwnershipHeader>() as u64,
        CACHE_LINE_SIZE as u64,
    )
}

fn items_size(item_count: u64) -> u64 {
    fam::round_up(item_count * 16, CACHE_LINE_SIZE as u64)
}

impl Ownership {
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

    pub fn size(&self) -> u64 {
        match &self.state {
            Some(state) => state.size,
            None => self.avail_size,
        }
    }

    pub fn count(&self) -> u64 {
        self.state.as_ref().map(|s| s.item_count).unwrap_or(0)
    }

    pub fn verify(&self) -> bool {
        // Safety: base maps at least one cache line.
        unsafe { fam::atomic_u64_read(self.base as *const u64) == OWNERSHIP_MAGIC }
    }

    /// Total on-shelf footprint for `item_count` slots; lets the caller lay
    /// out what follows the table before creating it.
    pub fn footprint(item_count: u64) -> u64 {
        header_size() + items_size(item_count)
    }

    pub fn create(&mut self, item_count: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        debug_assert!(item_count != 0);

        let total = Self::footprint(item_count);
        if self.avail_size < total {
            warn!(avail = self.avail_size, need = total, "ownership area too small");
            return Err(MmError::OwnershipCreateFailed);
        }
        // Safety: base maps avail_size >= total bytes.
        unsafe {
            std::ptr::write_bytes(self.base, 0, total as usize);
            fam::persist(self.base, total as usize);

            let header = self.base as *mut OwnershipHeader;
            (*header).item_count = item_count;
            (*header).size = total;
            fam::persist(self.base, header_size() as usize);
            fam::atomic_u64_write(&mut (*header).magic, OWNERSHIP_MAGIC);
            fam::persist(self.base, header_size() as usize);
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if !self.verify() {
            return Err(MmError::OwnershipDestroyFailed);
        }
        // Safety: base maps the recorded size.
        unsafe {
            let header = self.base as *mut OwnershipHeader;
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
            warn!("ownership magic mismatch");
            return Err(MmError::OwnershipOpenFailed);
        }
        // Safety: base maps at least the header.
        let (size, item_count) = unsafe {
            let header = self.base as *const OwnershipHeader;
            (
                fam::atomic_u64_read(&(*header).size),
                fam::atomic_u64_read(&(*header).item_count),
            )
        };
        if size > self.avail_size {
            warn!(size, avail = self.avail_size, "ownership larger than area");
            return Err(MmError::OwnershipOpenFailed);
        }
        self.state = Some(OpenState {
            size,
            item_count,
            pid: ProcessID::current(),
        });
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state.take().is_none() {
            return Err(MmError::InvalidArgument("ownership not open".into()));
        }
        Ok(())
    }

    /// Overrides the identity used for acquire/release. Tests use this to
    /// play the role of a second participant in one process.
    pub fn set_identity(&mut self, pid: ProcessID) {
        if let Some(state) = self.state.as_mut() {
            state.pid = pid;
        }
    }

    fn item_ptr(&self, item_idx: usize) -> Result<*mut u128> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| MmError::InvalidArgument("ownership not open".into()))?;
        if item_idx as u64 >= state.item_count {
            return Err(MmError::InvalidArgument(format!(
                "ownership item {item_idx} out of range"
            )));
        }
        // Safety: bounds-checked above; cells start one cache line in.
        Ok(unsafe { self.base.add(header_size() as usize + item_idx * 16) } as *mut u128)
    }

    fn identity(&self) -> ProcessID {
        self.state
            .as_ref()
            .map(|s| s.pid)
            .unwrap_or(ProcessID::NONE)
    }

    /// Claims slot `item_idx`; true iff this process now owns it.
    pub fn acquire_item(&self, item_idx: usize) -> Result<bool> {
        let item = self.item_ptr(item_idx)?;
        let me = self.identity();
        // Safety: item is a valid 16-byte aligned cell.
        let prev = unsafe { fam::atomic_u128_compare_and_store(item, 0, me.to_u128()) };
        Ok(prev == 0)
    }

    /// Releases slot `item_idx`; true iff our identity was still recorded.
    pub fn release_item(&self, item_idx: usize) -> Result<bool> {
        let item = self.item_ptr(item_idx)?;
        let me = self.identity();
        // Safety: item is a valid 16-byte aligned cell.
        let prev = unsafe { fam::atomic_u128_compare_and_store(item, me.to_u128(), 0) };
        Ok(prev == me.to_u128())
    }

    /// Whether the slot holds a valid owner identity.
    pub fn check_item(&self, item_idx: usize) -> Result<bool> {
        let item = self.item_ptr(item_idx)?;
        // Safety: item is a valid 16-byte aligned cell.
        let owner = ProcessID::from_u128(unsafe { fam::atomic_u128_read(item) });
        Ok(owner.is_valid())
    }

    /// Current owner of the slot, valid or not.
    pub fn owner(&self, item_idx: usize) -> Result<ProcessID> {
        let item = self.item_ptr(item_idx)?;
        // Safety: item is a valid 16-byte aligned cell.
        Ok(ProcessID::from_u128(unsafe { fam::atomic_u128_read(item) }))
    }

    /// Clears the slot if its recorded owner is no longer alive.
    pub fn check_and_revoke_item(&self, item_idx: usize) -> Result<()> {
        let item = self.item_ptr(item_idx)?;
        // Safety: item is a valid 16-byte aligned cell.
        let old = ProcessID::from_u128(unsafe { fam::atomic_u128_read(item) });
        if !old.is_valid() {
            return Ok(());
        }
        trace!(item_idx, owner = %old, "checking slot owner liveness");
        if old.is_alive() {
            return Ok(());
        }
        // Safety: as above.
        let prev = unsafe { fam::atomic_u128_compare_and_store(item, old.to_u128(), 0) };
        if prev == old.to_u128() {
            info!(item_idx, owner = %old, "revoked ownership of dead process");
        } else {
            info!(item_idx, owner = %old, "lost revocation race");
        }
        Ok(())
    }

    /// Like [`Self::check_and_revoke_item`], but atomically steals the dead
    /// owner's slot, runs `recover` over it, and releases on success. On
    /// recovery failure the dead owner identity is written back so another
    /// process can retry.
    pub fn check_and_revoke_with_recover<F>(&self, item_idx: usize, mut recover: F) -> Result<()>
    where
        F: FnMut(ShelfIndex) -> Result<()>,
    {
        let item = self.item_ptr(item_idx)?;
        // Safety: item is a valid 16-byte aligned cell.
        let old = ProcessID::from_u128(unsafe { fam::atomic_u128_read(item) });
        if !old.is_valid() || old.is_alive() {
            return Ok(());
        }
        let me = self.identity();
        // Safety: as above.
        let prev = unsafe { fam::atomic_u128_compare_and_store(item, old.to_u128(), me.to_u128()) };
        if prev != old.to_u128() {
            info!(item_idx, owner = %old, "another process is recovering this slot");
            return Ok(());
        }
        info!(item_idx, owner = %old, "recovering shelf of dead process");
        match recover(item_idx as ShelfIndex) {
            Ok(()) => {
                // Safety: as above.
                unsafe { fam::atomic_u128_write(item, 0) };
                info!(item_idx, "shelf recovered");
                Ok(())
            }
            Err(err) => {
                warn!(item_idx, error = %err, "recovery failed; restoring dead owner");
                // Safety: as above.
                unsafe { fam::atomic_u128_write(item, old.to_u128()) };
                Err(err)
            }
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
