// Epoch vector
//
// The shared record of epoch progress: a frontier counter plus one slot per
// participant holding its id, its last reported epoch, and the wall-clock
// time of its last report. The frontier only advances when every active
// participant has reported it, so `frontier - 1` bounds what any reader may
// still be working against.
//
// Each process also keeps a private observation cache per slot: the last
// value it saw and the local instant it saw the value change. Staleness
// decisions come from this cache, never from the shared wall-clock field, so
// clock skew between nodes cannot make a live participant look dead.
//
// Layout (offsets from the vector base):
//   [0..64)   { frontier: u64, n_slots: u64 }
//   [64..)    n_slots cache-line records { participant_id, reported_epoch,
//             last_modified_time (wall micros) }

use std::time::Instant;

use crate::error::{MmError, Result};
use crate::fam::{self, CACHE_LINE_SIZE};

/// Reported value of an empty slot.
pub const EPOCH_NO_PARTICIPANT: u64 = 0;

/// Smallest epoch a live participant can report; a fresh vector's frontier.
pub const EPOCH_MIN_ACTIVE: u64 = 1;

/// Capacity of the vector.
pub const EPOCH_SLOT_COUNT: u64 = 64;

#[repr(C)]
struct VectorHeader {
    frontier: u64,
    n_slots: u64,
}

#[repr(C)]
struct SlotRecord {
    participant_id: u64,
    reported_epoch: u64,
    last_modified_time: u64,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    participant_id: u64,
    reported: u64,
    last_change: Instant,
}

/// What a monitor scan learns about one slot.
#[derive(Clone, Copy)]
pub struct Observation {
    pub participant_id: u64,
    pub reported: u64,
    /// Local instant this process last saw the slot change.
    pub last_change: Instant,
}

pub struct EpochVector {
    base: *mut u8,
    cache: Vec<Option<CacheEntry>>,
}

// Safety: the shared part is only touched through fam atomics; the cache is
// process local.
unsafe impl Send for EpochVector {}

fn wall_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl EpochVector {
    /// Adopts the vector at `addr`, formatting it first if `may_create` and
    /// it has never been initialized (all-zero header).
    ///
    /// # Safety
    /// `addr` must be cache-line aligned and map enough bytes for the full
    /// vector for the life of this value.
    pub unsafe fn new(addr: *mut u8, may_create: bool) -> Result<Self> {
        debug_assert_eq!(addr as usize % CACHE_LINE_SIZE, 0);
        let header = addr as *mut VectorHeader;
        let n_slots = fam::atomic_u64_read(&(*header).n_slots);
        if n_slots == 0 {
            if !may_create {
                return Err(MmError::EpochVectorCorrupt("vector never initialized".into()));
            }
            let total = CACHE_LINE_SIZE + EPOCH_SLOT_COUNT as usize * CACHE_LINE_SIZE;
            std::ptr::write_bytes(addr, 0, total);
            fam::persist(addr, total);
            fam::atomic_u64_write(&mut (*header).frontier, EPOCH_MIN_ACTIVE);
            fam::atomic_u64_write(&mut (*header).n_slots, EPOCH_SLOT_COUNT);
            fam::persist(addr, CACHE_LINE_SIZE);
        } else if n_slots != EPOCH_SLOT_COUNT {
            return Err(MmError::EpochVectorCorrupt(format!(
                "slot count {n_slots} does not match the build"
            )));
        }
        Ok(Self {
            base: addr,
            cache: vec![None; EPOCH_SLOT_COUNT as usize],
        })
    }

    fn header(&self) -> *mut VectorHeader {
        self.base as *mut VectorHeader
    }

    fn slot(&self, slot: usize) -> *mut SlotRecord {
        debug_assert!(slot < EPOCH_SLOT_COUNT as usize);
        // Safety: slot records start one cache line in, one line each.
        unsafe { self.base.add(CACHE_LINE_SIZE * (1 + slot)) as *mut SlotRecord }
    }

    pub fn n_slots(&self) -> usize {
        EPOCH_SLOT_COUNT as usize
    }

    pub fn frontier(&self) -> u64 {
        // Safety: base maps the header.
        unsafe { fam::atomic_u64_read(&(*self.header()).frontier) }
    }

    /// CAS the frontier; returns the previously observed value.
    pub fn cas_frontier(&self, old: u64, new: u64) -> u64 {
        // Safety: base maps the header.
        unsafe { fam::atomic_u64_compare_and_store(&mut (*self.header()).frontier, old, new) }
    }

    /// Claims a free slot for `participant_id` and activates it at the
    /// current frontier.
    pub fn register_participant(&mut self, participant_id: u64) -> Result<usize> {
        if participant_id == 0 {
            return Err(MmError::EpochRegisterFailed("participant id 0".into()));
        }
        for slot in 0..self.n_slots() {
            let record = self.slot(slot);
            // Safety: record points at a mapped slot.
            let prev = unsafe {
                fam::atomic_u64_compare_and_store(
                    &mut (*record).participant_id,
                    EPOCH_NO_PARTICIPANT,
                    participant_id,
                )
            };
            if prev == EPOCH_NO_PARTICIPANT {
                self.set_reported(slot, self.frontier());
                return Ok(slot);
            }
        }
        Err(MmError::EpochRegisterFailed(format!(
            "all {} slots occupied",
            self.n_slots()
        )))
    }

    pub fn unregister_participant(&mut self, slot: usize) {
        let record = self.slot(slot);
        // Safety: record points at a mapped slot.
        unsafe {
            fam::atomic_u64_write(&mut (*record).reported_epoch, EPOCH_NO_PARTICIPANT);
            fam::atomic_u64_write(&mut (*record).participant_id, 0);
            fam::atomic_u64_write(&mut (*record).last_modified_time, 0);
            fam::persist(record as *const u8, CACHE_LINE_SIZE);
        }
        self.cache[slot] = None;
    }

    pub fn participant_id(&self, slot: usize) -> u64 {
        // Safety: record points at a mapped slot.
        unsafe { fam::atomic_u64_read(&(*self.slot(slot)).participant_id) }
    }

    pub fn reported(&self, slot: usize) -> u64 {
        // Safety: record points at a mapped slot.
        unsafe { fam::atomic_u64_read(&(*self.slot(slot)).reported_epoch) }
    }

    pub fn set_reported(&self, slot: usize, epoch: u64) {
        let record = self.slot(slot);
        // Safety: record points at a mapped slot.
        unsafe {
            fam::atomic_u64_write(&mut (*record).reported_epoch, epoch);
            fam::atomic_u64_write(&mut (*record).last_modified_time, wall_micros());
            fam::persist(record as *const u8, CACHE_LINE_SIZE);
        }
    }

    /// Protocol point before a scan: a value-caching reader would drop its
    /// cached slot values here. Observations in this build always read the
    /// fabric and the cache only carries change instants, which must survive
    /// invalidation, so there is nothing to drop.
    pub fn invalidate_cache(&mut self) {}

    /// Re-stamps every cached observation with the current instant. Called
    /// when the scanner itself was stalled, so its old timestamps would
    /// unfairly accuse everyone else of being stale.
    pub fn refresh_modified_time(&mut self) {
        let now = Instant::now();
        for entry in self.cache.iter_mut().flatten() {
            entry.last_change = now;
        }
    }

    /// Reads a slot and folds it into the observation cache; the returned
    /// `last_change` is the local instant the slot's value last changed.
    pub fn observe(&mut self, slot: usize) -> Observation {
        let participant_id = self.participant_id(slot);
        let reported = self.reported(slot);
        let now = Instant::now();
        let entry = self.cache[slot].get_or_insert(CacheEntry {
            participant_id,
            reported,
            last_change: now,
        });
        if entry.participant_id != participant_id || entry.reported != reported {
            entry.participant_id = participant_id;
            entry.reported = reported;
            entry.last_change = now;
        }
        Observation {
            participant_id,
            reported,
            last_change: entry.last_change,
        }
    }

    /// Clears the whole vector back to its freshly created state.
    pub fn reset(&mut self) {
        let total = CACHE_LINE_SIZE + EPOCH_SLOT_COUNT as usize * CACHE_LINE_SIZE;
        // Safety: base maps the full vector.
        unsafe {
            std::ptr::write_bytes(self.base, 0, total);
            fam::persist(self.base, total);
            fam::atomic_u64_write(&mut (*self.header()).frontier, EPOCH_MIN_ACTIVE);
            fam::atomic_u64_write(&mut (*self.header()).n_slots, EPOCH_SLOT_COUNT);
            fam::persist(self.base, CACHE_LINE_SIZE);
        }
        self.cache = vec![None; EPOCH_SLOT_COUNT as usize];
    }

    /// Human-readable dump for the monitor's debug output.
    pub fn dump(&self) -> String {
        let mut out = format!("frontier={}", self.frontier());
        for slot in 0..self.n_slots() {
            let pid = self.participant_id(slot);
            if pid != 0 {
                out.push_str(&format!(" [{}: pid={} reported={}]", slot, pid, self.reported(slot)));
            }
        }
        out
    }
}
