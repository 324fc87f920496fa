// Fabric memory primitives
//
// This module is the only place that touches fabric-attached memory with
// anything other than typed accessors: cache-line granular persistence,
// 32/64/128-bit atomics on raw shared mappings, and a spinlock that lives
// inside a mapped shelf. Allocator state machines in the rest of the crate
// assume these operations are visible to other processes (and other nodes
// sharing the fabric) without further synchronization.
//
// 128-bit compare-and-store uses the native cmpxchg16b instruction on
// x86_64. Targets without a 16-byte CAS fall back to an address-hashed
// spinlock table; that fallback is process-local only and exists so the
// crate still builds and tests on such hosts.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::error::{MmError, Result};

/// Cache line size assumed by every on-shelf layout.
pub const CACHE_LINE_SIZE: usize = 64;

/// Rounds `n` up to the next multiple of `unit` (`unit` must be a power of two).
pub fn round_up(n: u64, unit: u64) -> u64 {
    debug_assert!(unit.is_power_of_two());
    (n + unit - 1) & !(unit - 1)
}

/// Like [`round_up`] but maps 0 to `unit`, for sizes where zero is not a
/// meaningful extent (file truncation lengths).
pub fn round_up_nonzero(n: u64, unit: u64) -> u64 {
    if n == 0 {
        unit
    } else {
        round_up(n, unit)
    }
}

/// Flushes the cache lines covering `[addr, addr + len)` to the persistence
/// domain. A full fence on either side orders the flush against surrounding
/// stores.
pub fn persist(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    fence(Ordering::SeqCst);
    #[cfg(target_arch = "x86_64")]
    {
        let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            // Safety: caller guarantees the range is mapped; clflush on a
            // mapped address cannot fault.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE_SIZE;
        }
    }
    fence(Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// 32/64-bit atomics over raw shared memory
// ---------------------------------------------------------------------------

/// # Safety
/// `ptr` must be 4-byte aligned and inside a live mapping.
pub unsafe fn atomic_u32_read(ptr: *const u32) -> u32 {
    (*(ptr as *const AtomicU32)).load(Ordering::SeqCst)
}

/// # Safety
/// `ptr` must be 4-byte aligned and inside a live mapping.
pub unsafe fn atomic_u32_write(ptr: *mut u32, val: u32) {
    (*(ptr as *const AtomicU32)).store(val, Ordering::SeqCst)
}

/// # Safety
/// `ptr` must be 4-byte aligned and inside a live mapping.
pub unsafe fn atomic_u32_fetch_add(ptr: *mut u32, val: u32) -> u32 {
    (*(ptr as *const AtomicU32)).fetch_add(val, Ordering::SeqCst)
}

/// # Safety
/// `ptr` must be 4-byte aligned and inside a live mapping.
pub unsafe fn atomic_u32_compare_and_store(ptr: *mut u32, expected: u32, desired: u32) -> u32 {
    match (*(ptr as *const AtomicU32)).compare_exchange(
        expected,
        desired,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

/// # Safety
/// `ptr` must be 8-byte aligned and inside a live mapping.
pub unsafe fn atomic_u64_read(ptr: *const u64) -> u64 {
    (*(ptr as *const AtomicU64)).load(Ordering::SeqCst)
}

/// # Safety
/// `ptr` must be 8-byte aligned and inside a live mapping.
pub unsafe fn atomic_u64_write(ptr: *mut u64, val: u64) {
    (*(ptr as *const AtomicU64)).store(val, Ordering::SeqCst)
}

/// # Safety
/// `ptr` must be 8-byte aligned and inside a live mapping.
pub unsafe fn atomic_u64_fetch_add(ptr: *mut u64, val: u64) -> u64 {
    (*(ptr as *const AtomicU64)).fetch_add(val, Ordering::SeqCst)
}

/// Compare-and-store; returns the value observed before the operation, so a
/// return equal to `expected` means the store took effect.
///
/// # Safety
/// `ptr` must be 8-byte aligned and inside a live mapping.
pub unsafe fn atomic_u64_compare_and_store(ptr: *mut u64, expected: u64, desired: u64) -> u64 {
    match (*(ptr as *const AtomicU64)).compare_exchange(
        expected,
        desired,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

/// Reads a u64 on the allocator fast path. With the `non-cache-coherent`
/// feature every read is routed through the atomic library; otherwise a plain
/// volatile load suffices because the fabric is cache coherent.
///
/// # Safety
/// `ptr` must be 8-byte aligned and inside a live mapping.
pub unsafe fn read_u64(ptr: *const u64) -> u64 {
    #[cfg(feature = "non-cache-coherent")]
    {
        atomic_u64_read(ptr)
    }
    #[cfg(not(feature = "non-cache-coherent"))]
    {
        std::ptr::read_volatile(ptr)
    }
}

// ---------------------------------------------------------------------------
// 128-bit atomics
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
static HAS_CMPXCHG16B: Lazy<bool> = Lazy::new(|| std::is_x86_feature_detected!("cmpxchg16b"));

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "cmpxchg16b")]
unsafe fn cmpxchg16b(ptr: *mut u128, expected: u128, desired: u128) -> u128 {
    core::arch::x86_64::cmpxchg16b(ptr, expected, desired, Ordering::SeqCst, Ordering::SeqCst)
}

/// Fallback lock table for targets (or CPUs) without a native 16-byte CAS.
/// Hashing by address keeps unrelated words from serializing on one lock.
static U128_LOCKS: Lazy<Vec<Mutex<()>>> = Lazy::new(|| (0..64).map(|_| Mutex::new(())).collect());

fn u128_lock(ptr: *const u128) -> &'static Mutex<()> {
    &U128_LOCKS[(ptr as usize >> 4) % U128_LOCKS.len()]
}

/// Compare-and-store on a 16-byte aligned word; returns the previously
/// observed value (equal to `expected` on success).
///
/// # Safety
/// `ptr` must be 16-byte aligned and inside a live mapping.
pub unsafe fn atomic_u128_compare_and_store(ptr: *mut u128, expected: u128, desired: u128) -> u128 {
    debug_assert_eq!(ptr as usize % 16, 0);
    #[cfg(target_arch = "x86_64")]
    if *HAS_CMPXCHG16B {
        return cmpxchg16b(ptr, expected, desired);
    }
    let _guard = u128_lock(ptr).lock();
    let prev = std::ptr::read_volatile(ptr);
    if prev == expected {
        std::ptr::write_volatile(ptr, desired);
    }
    prev
}

/// Atomic 128-bit read, implemented as a compare-and-store whose expected and
/// desired values are equal: the operation never changes memory but always
/// returns the current contents.
///
/// # Safety
/// `ptr` must be 16-byte aligned and inside a live mapping.
pub unsafe fn atomic_u128_read(ptr: *const u128) -> u128 {
    atomic_u128_compare_and_store(ptr as *mut u128, 0, 0)
}

/// Atomic 128-bit write (CAS retry loop).
///
/// # Safety
/// `ptr` must be 16-byte aligned and inside a live mapping.
pub unsafe fn atomic_u128_write(ptr: *mut u128, val: u128) {
    let mut old = atomic_u128_read(ptr);
    loop {
        let prev = atomic_u128_compare_and_store(ptr, old, val);
        if prev == old {
            return;
        }
        old = prev;
    }
}

// ---------------------------------------------------------------------------
// Spinlock on fabric memory
// ---------------------------------------------------------------------------

/// A spinlock occupying one cache line of shared memory. The lock word is a
/// plain u32 so a zero-filled shelf starts with every lock released.
#[repr(C, align(64))]
pub struct FamSpinlock {
    word: AtomicU32,
    _pad: [u8; CACHE_LINE_SIZE - 4],
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

impl FamSpinlock {
    pub fn lock(&self) {
        let mut spins: u32 = 0;
        while self
            .word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Atomic region registry
// ---------------------------------------------------------------------------

// On fabrics where 128-bit operations go through an external atomic service,
// every mapping used with them must be registered first. On cache-coherent
// hosts the registry is bookkeeping only, but ShelfFile still drives it so
// the unmap path stays symmetric.
static REGISTERED_REGIONS: Lazy<Mutex<Vec<(usize, usize)>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn register_region(addr: *const u8, len: usize) -> Result<()> {
    if addr.is_null() || len == 0 {
        return Err(MmError::FamAtomicRegisterFailed(format!(
            "bad range {:p}+{}",
            addr, len
        )));
    }
    REGISTERED_REGIONS.lock().push((addr as usize, len));
    Ok(())
}

pub fn unregister_region(addr: *const u8, len: usize) {
    let mut regions = REGISTERED_REGIONS.lock();
    if let Some(pos) = regions
        .iter()
        .position(|&(a, l)| a == addr as usize && l == len)
    {
        regions.swap_remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
        assert_eq!(round_up_nonzero(0, 4096), 4096);
    }

    #[test]
    fn test_u32_ops() {
        let mut word: u32 = 1;
        let ptr = &mut word as *mut u32;
        unsafe {
            assert_eq!(atomic_u32_read(ptr), 1);
            atomic_u32_write(ptr, 3);
            assert_eq!(atomic_u32_fetch_add(ptr, 2), 3);
            assert_eq!(atomic_u32_compare_and_store(ptr, 5, 8), 5);
            assert_eq!(atomic_u32_compare_and_store(ptr, 5, 9), 8);
            assert_eq!(atomic_u32_read(ptr), 8);
        }
    }

    #[test]
    fn test_u64_ops() {
        let mut word: u64 = 5;
        let ptr = &mut word as *mut u64;
        unsafe {
            assert_eq!(atomic_u64_read(ptr), 5);
            atomic_u64_write(ptr, 9);
            assert_eq!(atomic_u64_fetch_add(ptr, 1), 9);
            assert_eq!(atomic_u64_compare_and_store(ptr, 10, 20), 10);
            assert_eq!(atomic_u64_compare_and_store(ptr, 10, 30), 20);
            assert_eq!(atomic_u64_read(ptr), 20);
        }
    }

    #[test]
    fn test_u128_cas() {
        #[repr(align(16))]
        struct Aligned(u128);
        let mut word = Aligned(7);
        let ptr = &mut word.0 as *mut u128;
        unsafe {
            assert_eq!(atomic_u128_read(ptr), 7);
            assert_eq!(atomic_u128_compare_and_store(ptr, 7, 11), 7);
            assert_eq!(atomic_u128_read(ptr), 11);
            // failed CAS reports the live value and leaves memory untouched
            assert_eq!(atomic_u128_compare_and_store(ptr, 7, 99), 11);
            assert_eq!(atomic_u128_read(ptr), 11);
            atomic_u128_write(ptr, u128::MAX);
            assert_eq!(atomic_u128_read(ptr), u128::MAX);
        }
    }

    #[test]
    fn test_spinlock_mutual_exclusion() {
        let lock = Arc::new(FamSpinlock {
            word: AtomicU32::new(0),
            _pad: [0; CACHE_LINE_SIZE - 4],
        });
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_region_registry() {
        let buf = [0u8; 64];
        register_region(buf.as_ptr(), buf.len()).unwrap();
        unregister_region(buf.as_ptr(), buf.len());
        assert!(register_region(std::ptr::null(), 64).is_err());
    }
}
