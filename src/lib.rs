// shelfmem - multi-process memory manager for fabric-attached and
// persistent shared memory
//
// A pool of shelf-backed storage is exposed either as a Region (a raw mapped
// byte range) or as a Heap (a sub-allocator handing out persistent global
// pointers). Many processes, possibly on different nodes sharing the backing
// store, can create, open, allocate from, and destroy pools concurrently; a
// crashed process never leaves a heap permanently unusable.
//
// Process lifecycle: call `start` once with the backing directory and user
// namespace, then take handles from `memory_manager()` / `epoch_manager()`.
// `reset` wipes all persisted state of a namespace; `restart` re-initializes
// the process services while keeping persisted state. Tests build private
// `MemoryManager` / `EpochManager` instances from their own `Config`
// instead of going through the globals.

pub mod allocator;
pub mod config;
pub mod epoch;
pub mod epoch_shelf;
pub mod error;
pub mod fam;
pub mod global_ptr;
pub mod memory_manager;
pub mod process_id;
pub mod root_shelf;
pub mod shelf_id;
pub mod shelf_mgmt;
pub mod shelf_usage;

pub use allocator::{DistHeap, PoolRegion};
pub use config::Config;
pub use epoch::{EpochGuard, EpochManager};
pub use error::{MmError, Result};
pub use global_ptr::{GlobalPtr, Offset};
pub use memory_manager::{MemoryManager, RootPtrSlot};
pub use process_id::ProcessID;
pub use shelf_id::{PoolId, ShelfId, ShelfIndex};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::epoch_shelf::EpochShelf;
use crate::root_shelf::RootShelf;

struct Services {
    memory_manager: Arc<MemoryManager>,
    epoch_manager: Arc<EpochManager>,
}

static SERVICES: Lazy<RwLock<Option<Services>>> = Lazy::new(|| RwLock::new(None));

/// Initializes process-wide state for the `(base, user)` namespace: creates
/// the backing directory, the root shelf, and the epoch shelf when missing,
/// then installs the global MemoryManager and EpochManager.
pub fn start(base: impl Into<std::path::PathBuf>, user: impl Into<String>) -> Result<()> {
    let config = Config::new(base, user);
    start_with_config(config)
}

pub fn start_with_config(config: Config) -> Result<()> {
    if !config.shelf_base.exists() {
        std::fs::create_dir_all(&config.shelf_base)?;
    }

    let mut root = RootShelf::new(config.root_shelf_path());
    if !root.exist() {
        match root.create() {
            Ok(()) | Err(MmError::ShelfFileFound(_)) => {}
            Err(err) => return Err(err),
        }
    }
    let mut epoch = EpochShelf::new(config.epoch_shelf_path());
    if !epoch.exist() {
        match epoch.create() {
            Ok(()) | Err(MmError::ShelfFileFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let memory_manager = Arc::new(MemoryManager::new(config.clone())?);
    let epoch_manager = Arc::new(EpochManager::new(&config)?);

    let mut services = SERVICES.write();
    if let Some(old) = services.take() {
        old.epoch_manager.stop();
    }
    *services = Some(Services {
        memory_manager,
        epoch_manager,
    });
    info!(base = %config.shelf_base.display(), user = %config.shelf_user, "shelfmem started");
    Ok(())
}

/// Stops the process-wide services: joins the epoch threads and releases the
/// root shelf. Persistent state is untouched. Shelf mappings held by live
/// Region/Heap handles stay with their handles; `ShelfManager::reset` exists
/// for embedders that can prove no handle survives.
pub fn stop() {
    let mut services = SERVICES.write();
    if let Some(old) = services.take() {
        old.epoch_manager.stop();
    }
    drop(services);
    info!("shelfmem stopped");
}

/// Removes all persisted state of the `(base, user)` namespace: the root
/// shelf, the epoch shelf, and every pool shelf.
pub fn reset(base: impl Into<std::path::PathBuf>, user: impl Into<String>) -> Result<()> {
    stop();
    let config = Config::new(base, user);
    let _ = std::fs::remove_file(config.root_shelf_path());
    let _ = std::fs::remove_file(config.epoch_shelf_path());
    let prefix = config
        .shelf_prefix()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Ok(entries) = std::fs::read_dir(&config.shelf_base) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    info!(base = %config.shelf_base.display(), user = %config.shelf_user, "shelfmem reset");
    Ok(())
}

/// Stops and re-initializes the process services without destroying any
/// persisted state.
pub fn restart(base: impl Into<std::path::PathBuf>, user: impl Into<String>) -> Result<()> {
    stop();
    start(base, user)
}

/// The process-wide MemoryManager installed by [`start`].
pub fn memory_manager() -> Result<Arc<MemoryManager>> {
    SERVICES
        .read()
        .as_ref()
        .map(|s| s.memory_manager.clone())
        .ok_or_else(|| MmError::InvalidArgument("shelfmem::start has not been called".into()))
}

/// The process-wide EpochManager installed by [`start`].
pub fn epoch_manager() -> Result<Arc<EpochManager>> {
    SERVICES
        .read()
        .as_ref()
        .map(|s| s.epoch_manager.clone())
        .ok_or_else(|| MmError::InvalidArgument("shelfmem::start has not been called".into()))
}
