// End-to-end scenarios: regions, heaps, remote free hand-off, and the
// process lifecycle, each against its own namespace in a fresh directory.

use shelfmem::shelf_mgmt::ShelfFile;
use shelfmem::shelf_usage::{FreeLists, Ownership};
use shelfmem::{Config, GlobalPtr, MemoryManager, MmError, ShelfId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

fn fresh_manager(tag: &str) -> (tempfile::TempDir, MemoryManager) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path(), tag);
    let mut root = shelfmem::root_shelf::RootShelf::new(config.root_shelf_path());
    root.create().unwrap();
    (dir, MemoryManager::new(config).unwrap())
}

#[test]
fn test_region_round_trip() {
    let (_dir, mm) = fresh_manager("region");
    let size = 128u64 << 20;
    mm.create_region(1, size).unwrap();

    let mut region = mm.find_region(1).unwrap();
    region.open(libc::O_RDWR).unwrap();
    let addr = region
        .map(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
        )
        .unwrap();
    // Safety: addr maps the full region payload.
    unsafe { shelfmem::fam::atomic_u64_write(addr as *mut u64, 123) };
    region.unmap(addr, size).unwrap();
    region.close().unwrap();

    // reopen and remap: the write must have persisted
    region.open(libc::O_RDWR).unwrap();
    let addr = region
        .map(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
        )
        .unwrap();
    // Safety: addr maps the full region payload.
    assert_eq!(unsafe { shelfmem::fam::atomic_u64_read(addr as *const u64) }, 123);
    region.unmap(addr, size).unwrap();
    region.close().unwrap();

    mm.destroy_region(1).unwrap();
}

#[test]
fn test_heap_round_trip() {
    let (_dir, mm) = fresh_manager("heap");
    mm.create_heap(2, 128 << 20, 0, 0o600).unwrap();

    let mut heap = mm.find_heap(2).unwrap();
    heap.open().unwrap();

    let mut ptrs = vec![];
    for i in 0..10u64 {
        let ptr = heap.alloc(4);
        assert!(ptr.is_valid());
        let local = mm.global_to_local(ptr);
        assert!(!local.is_null());
        // Safety: each allocation is at least a cache line.
        unsafe { std::ptr::write_volatile(local as *mut u64, i) };
        // round trip through the registry
        assert_eq!(mm.local_to_global(local), ptr);
        ptrs.push(ptr);
    }

    heap.close().unwrap();
    heap.open().unwrap();
    for (i, ptr) in ptrs.iter().enumerate() {
        let local = mm.global_to_local(*ptr);
        assert!(!local.is_null());
        // Safety: the allocations are still live.
        assert_eq!(unsafe { std::ptr::read_volatile(local as *const u64) }, i as u64);
    }
    for ptr in ptrs {
        heap.free(ptr).unwrap();
    }
    heap.close().unwrap();
    mm.destroy_heap(2).unwrap();
}

#[test]
fn test_repeated_create_reports_id_found() {
    let (_dir, mm) = fresh_manager("dup");
    mm.create_heap(3, 1 << 20, 0, 0o600).unwrap();
    for _ in 0..3 {
        assert!(matches!(
            mm.create_heap(3, 1 << 20, 0, 0o600),
            Err(MmError::IdFound(3))
        ));
    }
    mm.destroy_heap(3).unwrap();
}

#[test]
fn test_freelists_lifo_on_real_shelf() {
    // the §communication-shelf shape: FreeLists living on a 128 MiB shelf
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comm_shelf");
    let size = 128u64 << 20;
    let mut shelf = ShelfFile::new(&path);
    shelf.create(0o600, size).unwrap();
    shelf.open(libc::O_RDWR).unwrap();
    let base = shelf
        .map(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )
        .unwrap();

    // Safety: base maps the whole shelf for the scope below.
    {
        let mut lists = unsafe { FreeLists::new(base, size) };
        lists.create(16).unwrap();
        lists.open().unwrap();
        for i in 0..16u8 {
            for j in 0..10u64 {
                lists
                    .put_pointer(i, GlobalPtr::new(ShelfId::new(1, i), (j + 1) * 64))
                    .unwrap();
            }
        }
        for i in 0..16u8 {
            // LIFO per index: offsets come back 10*64 down to 1*64
            for j in (0..10u64).rev() {
                let ptr = lists.get_pointer(i).unwrap();
                assert_eq!(ptr, GlobalPtr::new(ShelfId::new(1, i), (j + 1) * 64));
            }
            assert!(matches!(lists.get_pointer(i), Err(MmError::FreeListsEmpty)));
        }
        lists.close().unwrap();
    }

    shelf.unmap(base, size, false).unwrap();
    shelf.close().unwrap();
    shelf.destroy().unwrap();
}

#[test]
fn test_ownership_single_owner_on_real_shelf() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("own_shelf");
    let size = 1u64 << 20;
    let mut shelf = ShelfFile::new(&path);
    shelf.create(0o600, size).unwrap();
    shelf.open(libc::O_RDWR).unwrap();
    let base = shelf
        .map(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            false,
        )
        .unwrap();

    // Safety: base maps the whole shelf for the scope below.
    {
        let mut table = unsafe { Ownership::new(base, size) };
        table.create(64).unwrap();
        table.open().unwrap();

        let mut other = unsafe { Ownership::new(base, size) };
        other.open().unwrap();
        other.set_identity(shelfmem::ProcessID::from_u128(
            (4_194_290u128) | (11u128 << 64),
        ));

        for i in 0..64usize {
            assert!(table.acquire_item(i).unwrap());
        }
        for i in 0..64usize {
            // second acquire fails from both identities
            assert!(!table.acquire_item(i).unwrap());
            assert!(!other.acquire_item(i).unwrap());
            assert!(table.check_item(i).unwrap());
        }
        for i in 0..64usize {
            assert!(table.release_item(i).unwrap());
            assert!(other.acquire_item(i).unwrap());
            assert!(other.release_item(i).unwrap());
        }
        other.close().unwrap();
        table.close().unwrap();
    }

    shelf.unmap(base, size, false).unwrap();
    shelf.close().unwrap();
    shelf.destroy().unwrap();
}

#[test]
fn test_remote_free_returns_space_to_allocator() {
    // two heap handles play two processes sharing one pool: B frees a
    // pointer it does not own, A reabsorbs the space and can allocate again
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path(), "remote");
    let mut root = shelfmem::root_shelf::RootShelf::new(config.root_shelf_path());
    root.create().unwrap();
    let mm = MemoryManager::new(config.clone()).unwrap();

    // zone shelves so freed space is actually reusable; the shelf holds
    // exactly two 512 KiB chunks once fully grown
    mm.create_heap(4, 2 << 20, 64, 0o600).unwrap();
    let mut a = mm.find_heap(4).unwrap();
    a.open().unwrap();
    let mut b = mm.find_heap(4).unwrap();
    b.open().unwrap();

    // a fills its shelf
    let p1 = a.alloc(512 << 10);
    let p2 = a.alloc(512 << 10);
    assert!(p1.is_valid());
    assert!(p2.is_valid());

    // b releases p1 by remote free; it lands on a's free list, not locally
    b.free(p1).unwrap();
    assert!(b.global_to_local(p1).is_err());

    // a's shelf is exhausted, so its next alloc drains the hand-off and
    // hands the very same chunk back out
    let p3 = a.alloc(512 << 10);
    assert_eq!(p3, p1, "remote free must be reabsorbed before growing");

    b.close().unwrap();
    a.close().unwrap();
    mm.destroy_heap(4).unwrap();
}

#[test]
fn test_process_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_path_buf();

    shelfmem::start(&base, "lifecycle").unwrap();
    let mm = shelfmem::memory_manager().unwrap();
    let em = shelfmem::epoch_manager().unwrap();

    mm.create_heap(5, 1 << 20, 0, 0o600).unwrap();
    {
        let _guard = em.critical();
        assert!(em.exists_active_critical());
    }

    // restart keeps persisted state
    shelfmem::restart(&base, "lifecycle").unwrap();
    let mm = shelfmem::memory_manager().unwrap();
    assert!(mm.find_heap(5).is_ok());

    // reset wipes it
    shelfmem::reset(&base, "lifecycle").unwrap();
    assert!(shelfmem::memory_manager().is_err());
    assert!(!Config::new(&base, "lifecycle").root_shelf_path().exists());

    // a fresh start builds a clean namespace
    shelfmem::start(&base, "lifecycle").unwrap();
    let mm = shelfmem::memory_manager().unwrap();
    assert!(mm.find_heap(5).is_err());
    shelfmem::stop();
}
