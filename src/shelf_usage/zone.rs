// Buddy zone allocator
//
// The per-shelf heap used when a pool is created with a nonzero minimum
// allocation size. Chunks are powers of two from `min_chunk_size` up to the
// zone capacity; free chunks are tracked twice:
//
//  - per-level bitmaps, the durable truth (bit set <=> chunk free at that
//    level), every mutation a single persisted 64-bit atomic write;
//  - per-level lock-free stacks, the fast path for alloc/free.
//
// Only the shelf's owner process mutates a zone (DistHeap enforces this
// through the Ownership table), so the state machines here defend against
// crashes, not against concurrent writers.
//
// Growing the zone and merging buddies are explicit state machines: each
// sets an in-progress flag, persists after every edge, and clears the flag
// last. Merge sets the parent bit before clearing the two child bits, so a
// crash can only leave a chunk claimable at two levels, never at none;
// recovery at open re-clears children of any set parent and rebuilds every
// stack from the bitmaps.
//
// External offsets are absolute from the zone base with the chunk's level
// encoded in the low 6 bits (chunks are at least 64 bytes, so those bits of
// a chunk address are always zero). That lets Free recover the size without
// any per-chunk header.

use tracing::{debug, warn};

use crate::fam::{self, CACHE_LINE_SIZE};
use crate::global_ptr::Offset;
use crate::shelf_usage::stack::Stack;

pub const ZONE_MAGIC: u64 = 905584235;

/// Enough levels for a 64-byte min chunk inside any 56-bit offset space.
const MAX_LEVELS: usize = 50;

const LEVEL_MASK: u64 = (CACHE_LINE_SIZE - 1) as u64;

#[repr(C)]
struct ZoneHeader {
    magic: u64,
    min_chunk_size: u64,
    max_zone_size: u64,
    current_zone_size: u64,
    num_levels: u64,
    grow_in_progress: u64,
    merge_in_progress: u64,
    merge_level: u64,
}

pub struct Zone {
    base: *mut u8,
    min_chunk: u64,
    num_levels: usize,
    data_start: u64,
    /// byte offset of each level's bitmap words, from the zone base
    bitmap_start: Vec<u64>,
}

// Safety: all mutation of the shared area goes through fam atomics; the
// owner serialization is enforced by the caller.
unsafe impl Send for Zone {}

struct Geometry {
    num_levels: usize,
    max_data: u64,
    data_start: u64,
    bitmap_start: Vec<u64>,
}

/// Computes the metadata layout for an area of `avail_size` bytes: header,
/// level stacks, per-level bitmaps, then the chunk area rounded up to the
/// min chunk size.
fn geometry(min_chunk: u64, avail_size: u64) -> Option<Geometry> {
    let header = fam::round_up(std::mem::size_of::<ZoneHeader>() as u64, CACHE_LINE_SIZE as u64);
    let stacks = fam::round_up(
        (MAX_LEVELS * std::mem::size_of::<Stack>()) as u64,
        CACHE_LINE_SIZE as u64,
    );

    // find the largest power-of-two data area that fits with its metadata
    let mut max_data = min_chunk;
    let mut best: Option<Geometry> = None;
    loop {
        let num_levels = ((max_data / min_chunk).trailing_zeros() + 1) as usize;
        if num_levels > MAX_LEVELS {
            break;
        }
        let mut bitmap_start = Vec::with_capacity(num_levels);
        let mut cursor = header + stacks;
        for level in 0..num_levels {
            bitmap_start.push(cursor);
            let bits = max_data / (min_chunk << level);
            cursor += ((bits + 63) / 64) * 8;
        }
        let data_start = fam::round_up(cursor, min_chunk);
        if data_start + max_data > avail_size {
            break;
        }
        best = Some(Geometry {
            num_levels,
            max_data,
            data_start,
            bitmap_start,
        });
        max_data *= 2;
    }
    best
}

impl Zone {
    /// Formats a zone over `[addr, addr + avail_size)` with an initial
    /// extent of roughly `initial_size` bytes.
    ///
    /// # Safety
    /// `addr` must be cache-line aligned, map `avail_size` bytes, and have
    /// no concurrent opener.
    pub unsafe fn create(
        addr: *mut u8,
        initial_size: u64,
        min_chunk_size: u64,
        avail_size: u64,
    ) -> Option<Zone> {
        let min_chunk = fam::round_up(min_chunk_size.max(CACHE_LINE_SIZE as u64), CACHE_LINE_SIZE as u64)
            .next_power_of_two();
        let geo = geometry(min_chunk, avail_size)?;

        // wipe metadata
        std::ptr::write_bytes(addr, 0, geo.data_start as usize);
        fam::persist(addr, geo.data_start as usize);

        let header = addr as *mut ZoneHeader;
        (*header).min_chunk_size = min_chunk;
        (*header).max_zone_size = geo.max_data;
        (*header).num_levels = geo.num_levels as u64;

        // the initial extent is one chunk: the largest power of two at or
        // below initial_size, clamped into [min_chunk, max_data]
        let mut current = initial_size.max(min_chunk).min(geo.max_data);
        if !current.is_power_of_two() {
            current = (current / 2 + 1).next_power_of_two().min(geo.max_data);
        }
        (*header).current_zone_size = current;
        fam::persist(addr, CACHE_LINE_SIZE);

        let zone = Zone {
            base: addr,
            min_chunk,
            num_levels: geo.num_levels,
            data_start: geo.data_start,
            bitmap_start: geo.bitmap_start,
        };

        // the whole initial extent is one free chunk at its level
        let level = zone.level_of_size(current);
        zone.set_bit(level, 0);
        zone.stack(level).push(addr, zone.data_start);

        fam::atomic_u64_write(&mut (*header).magic, ZONE_MAGIC);
        fam::persist(addr, CACHE_LINE_SIZE);
        Some(zone)
    }

    /// Adopts an existing zone, completing any interrupted grow or merge
    /// before returning.
    ///
    /// # Safety
    /// `addr` must be the base a prior `create` formatted, mapped for
    /// `avail_size` bytes, with this process holding the shelf's ownership.
    pub unsafe fn open(addr: *mut u8, avail_size: u64) -> Option<Zone> {
        if fam::atomic_u64_read(addr as *const u64) != ZONE_MAGIC {
            return None;
        }
        let header = addr as *const ZoneHeader;
        let min_chunk = fam::read_u64(&(*header).min_chunk_size);
        let geo = geometry(min_chunk, avail_size)?;
        if geo.max_data < fam::read_u64(&(*header).max_zone_size) {
            warn!("zone area shrank since creation");
            return None;
        }
        let zone = Zone {
            base: addr,
            min_chunk,
            num_levels: fam::read_u64(&(*header).num_levels) as usize,
            data_start: geo.data_start,
            bitmap_start: geo.bitmap_start,
        };
        zone.grow_crash_recovery();
        zone.merge_crash_recovery();
        Some(zone)
    }

    /// # Safety
    /// `addr` must map at least one cache line.
    pub unsafe fn verify(addr: *const u8) -> bool {
        fam::atomic_u64_read(addr as *const u64) == ZONE_MAGIC
    }

    fn header(&self) -> *mut ZoneHeader {
        self.base as *mut ZoneHeader
    }

    fn chunk_size(&self, level: usize) -> u64 {
        self.min_chunk << level
    }

    /// Level whose chunk size equals `size` (size must be a power-of-two
    /// multiple of the min chunk).
    fn level_of_size(&self, size: u64) -> usize {
        (size / self.min_chunk).trailing_zeros() as usize
    }

    fn level_for_request(&self, size: u64) -> Option<usize> {
        let size = size.max(1);
        let rounded = fam::round_up(size, self.min_chunk).next_power_of_two();
        let level = self.level_of_size(rounded);
        if level < self.num_levels {
            Some(level)
        } else {
            None
        }
    }

    fn stack(&self, level: usize) -> &Stack {
        let header = fam::round_up(
            std::mem::size_of::<ZoneHeader>() as u64,
            CACHE_LINE_SIZE as u64,
        );
        // Safety: the stack array begins one rounded header in; level is
        // bounded by num_levels <= MAX_LEVELS.
        unsafe {
            &*(self
                .base
                .add(header as usize + level * std::mem::size_of::<Stack>())
                as *const Stack)
        }
    }

    /// Currently grown extent of the chunk area.
    pub fn current_size(&self) -> u64 {
        // Safety: base maps the header.
        unsafe { fam::atomic_u64_read(&(*self.header()).current_zone_size) }
    }

    fn max_size(&self) -> u64 {
        // Safety: base maps the header.
        unsafe { fam::read_u64(&(*self.header()).max_zone_size) }
    }

    // -- bitmaps ----------------------------------------------------------

    fn bitmap_word(&self, level: usize, rel: u64) -> (*mut u64, u64) {
        let chunk_idx = rel / self.chunk_size(level);
        let word_off = self.bitmap_start[level] + (chunk_idx / 64) * 8;
        let mask = 1u64 << (chunk_idx % 64);
        (
            // Safety: word_off stays inside the bitmap area by construction.
            unsafe { self.base.add(word_off as usize) } as *mut u64,
            mask,
        )
    }

    fn test_bit(&self, level: usize, rel: u64) -> bool {
        let (word, mask) = self.bitmap_word(level, rel);
        // Safety: word points into the mapped bitmap area.
        unsafe { fam::atomic_u64_read(word) & mask != 0 }
    }

    fn set_bit(&self, level: usize, rel: u64) {
        let (word, mask) = self.bitmap_word(level, rel);
        // Safety: word points into the mapped bitmap area; single writer.
        unsafe {
            let val = fam::atomic_u64_read(word);
            fam::atomic_u64_write(word, val | mask);
            fam::persist(word as *const u8, 8);
        }
    }

    fn clear_bit(&self, level: usize, rel: u64) {
        let (word, mask) = self.bitmap_word(level, rel);
        // Safety: word points into the mapped bitmap area; single writer.
        unsafe {
            let val = fam::atomic_u64_read(word);
            fam::atomic_u64_write(word, val & !mask);
            fam::persist(word as *const u8, 8);
        }
    }

    // -- alloc / free -----------------------------------------------------

    /// Allocates a chunk of at least `size` bytes; 0 when the zone cannot
    /// satisfy the request even after growing.
    pub fn alloc(&self, size: u64) -> Offset {
        let target = match self.level_for_request(size) {
            Some(level) => level,
            None => return 0,
        };
        loop {
            for level in target..self.num_levels {
                // Safety: stacks and chunks live inside the mapping.
                let abs = unsafe { self.stack(level).pop(self.base) };
                if abs == 0 {
                    continue;
                }
                let rel = abs - self.data_start;
                // split down to the target level; clearing the parent first
                // means a crash leaks the chunk rather than doubling it
                self.clear_bit(level, rel);
                let mut level_now = level;
                while level_now > target {
                    level_now -= 1;
                    let buddy_rel = rel + self.chunk_size(level_now);
                    self.set_bit(level_now, buddy_rel);
                    // Safety: buddy chunk lies inside the mapped extent.
                    unsafe {
                        self.stack(level_now)
                            .push(self.base, self.data_start + buddy_rel)
                    };
                }
                return (self.data_start + rel) | target as u64;
            }
            if !self.grow() {
                return 0;
            }
        }
    }

    /// Returns a chunk allocated by [`Self::alloc`]. `free(0)` is a no-op.
    pub fn free(&self, offset: Offset) {
        if offset == 0 {
            return;
        }
        let level = (offset & LEVEL_MASK) as usize;
        let abs = offset & !LEVEL_MASK;
        debug_assert!(level < self.num_levels);
        let rel = abs - self.data_start;
        self.set_bit(level, rel);
        // Safety: the chunk lies inside the mapped extent.
        unsafe { self.stack(level).push(self.base, abs) };
    }

    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        if offset == 0 {
            return false;
        }
        let level = (offset & LEVEL_MASK) as usize;
        let abs = offset & !LEVEL_MASK;
        if level >= self.num_levels || abs < self.data_start {
            return false;
        }
        let rel = abs - self.data_start;
        let size = self.chunk_size(level);
        rel % size == 0 && rel + size <= self.current_size()
    }

    /// Local address of an external offset.
    pub fn offset_to_ptr(&self, offset: Offset) -> *mut u8 {
        debug_assert!(self.is_valid_offset(offset));
        // Safety: validated to lie inside the mapping.
        unsafe { self.base.add((offset & !LEVEL_MASK) as usize) }
    }

    // -- grow -------------------------------------------------------------

    /// Doubles the zone extent, publishing the new upper half as one free
    /// chunk. Returns false at capacity.
    fn grow(&self) -> bool {
        let header = self.header();
        let current = self.current_size();
        if current >= self.max_size() {
            return false;
        }
        debug!(current, "growing zone");
        // Safety: base maps the header; single writer.
        unsafe {
            fam::atomic_u64_write(&mut (*header).grow_in_progress, 1);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
        }
        // the new region [current, 2*current) is one chunk at current's level
        let level = self.level_of_size(current);
        self.set_bit(level, current);
        // Safety: as above.
        unsafe {
            fam::atomic_u64_write(&mut (*header).current_zone_size, current * 2);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
            fam::atomic_u64_write(&mut (*header).grow_in_progress, 0);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
            self.stack(level).push(self.base, self.data_start + current);
        }
        true
    }

    fn grow_crash_recovery(&self) {
        let header = self.header();
        // Safety: base maps the header.
        if unsafe { fam::atomic_u64_read(&(*header).grow_in_progress) } == 0 {
            return;
        }
        warn!("completing interrupted zone grow");
        let current = self.current_size();
        // a bit persisted beyond the recorded extent belongs to the
        // unfinished grow; clear it and let the grow be retried
        for level in 0..self.num_levels {
            let size = self.chunk_size(level);
            let mut rel = fam::round_up(current, size);
            while rel + size <= self.max_size() {
                if self.test_bit(level, rel) {
                    self.clear_bit(level, rel);
                }
                rel += size;
            }
        }
        self.rebuild_stacks();
        // Safety: as above; single writer.
        unsafe {
            fam::atomic_u64_write(&mut (*header).grow_in_progress, 0);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
        }
    }

    // -- merge ------------------------------------------------------------

    /// Coalesces free buddy pairs level by level. Callable whenever the
    /// owner likes; typically after a burst of frees.
    pub fn start_merge(&self) {
        for level in 0..self.num_levels.saturating_sub(1) {
            self.merge_level(level);
        }
    }

    fn merge_level(&self, level: usize) {
        let header = self.header();
        // Safety: base maps the header; single writer.
        unsafe {
            fam::atomic_u64_write(&mut (*header).merge_level, level as u64);
            fam::atomic_u64_write(&mut (*header).merge_in_progress, 1);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
        }

        // drain the level; pair buddies through the bitmap
        let size = self.chunk_size(level);
        let mut drained = Vec::new();
        loop {
            // Safety: stack blocks live inside the mapping.
            let abs = unsafe { self.stack(level).pop(self.base) };
            if abs == 0 {
                break;
            }
            drained.push(abs - self.data_start);
        }
        drained.sort_unstable();

        let mut merged = 0usize;
        let mut i = 0;
        while i < drained.len() {
            let rel = drained[i];
            let buddy = rel ^ size;
            if i + 1 < drained.len() && drained[i + 1] == buddy {
                let parent = rel & !size;
                // parent bit first: a crash leaves the pair claimable at
                // both levels, which recovery resolves downward
                self.set_bit(level + 1, parent);
                self.clear_bit(level, rel);
                self.clear_bit(level, buddy);
                // Safety: as above.
                unsafe {
                    self.stack(level + 1)
                        .push(self.base, self.data_start + parent)
                };
                merged += 1;
                i += 2;
            } else {
                // Safety: as above.
                unsafe { self.stack(level).push(self.base, self.data_start + rel) };
                i += 1;
            }
        }
        if merged > 0 {
            debug!(level, merged, "merged buddy pairs");
        }

        // Safety: as above.
        unsafe {
            fam::atomic_u64_write(&mut (*header).merge_in_progress, 0);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
        }
    }

    fn merge_crash_recovery(&self) {
        let header = self.header();
        // Safety: base maps the header.
        if unsafe { fam::atomic_u64_read(&(*header).merge_in_progress) } == 0 {
            return;
        }
        // Safety: as above.
        let level = unsafe { fam::atomic_u64_read(&(*header).merge_level) };
        warn!(level, "completing interrupted zone merge");
        // redo: any set parent claims its children; clear child bits
        for level in (1..self.num_levels).rev() {
            let size = self.chunk_size(level);
            let mut rel = 0;
            while rel + size <= self.current_size() {
                if self.test_bit(level, rel) {
                    let half = self.chunk_size(level - 1);
                    if self.test_bit(level - 1, rel) {
                        self.clear_bit(level - 1, rel);
                    }
                    if self.test_bit(level - 1, rel + half) {
                        self.clear_bit(level - 1, rel + half);
                    }
                }
                rel += size;
            }
        }
        self.rebuild_stacks();
        // Safety: as above; single writer.
        unsafe {
            fam::atomic_u64_write(&mut (*header).merge_in_progress, 0);
            fam::persist(header as *const u8, CACHE_LINE_SIZE);
        }
    }

    /// Re-derives every free stack from the bitmaps. The stacks are a cache
    /// of the bitmaps; after an interrupted transition they are the stale
    /// side and get thrown away wholesale.
    fn rebuild_stacks(&self) {
        for level in 0..self.num_levels {
            self.stack(level).init();
        }
        for level in 0..self.num_levels {
            let size = self.chunk_size(level);
            let mut rel = 0;
            while rel + size <= self.current_size() {
                if self.test_bit(level, rel) {
                    // Safety: the chunk lies inside the mapped extent.
                    unsafe { self.stack(level).push(self.base, self.data_start + rel) };
                }
                rel += size;
            }
        }
    }
}
