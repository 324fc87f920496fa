use crate::global_ptr::GlobalPtr;
use crate::shelf_id::PoolId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // pool-id space (MemoryManager boundary)
    #[error("pool id {0} is in use")]
    IdFound(PoolId),

    #[error("pool id {0} is not found")]
    IdNotFound(PoolId),

    // pool directory
    #[error("pool {0} already exists")]
    PoolFound(PoolId),

    #[error("pool {0} does not exist")]
    PoolNotFound(PoolId),

    #[error("pool operation failed: {0}")]
    PoolFailed(String),

    // shelf files
    #[error("shelf file already exists: {0}")]
    ShelfFileFound(String),

    #[error("shelf file not found: {0}")]
    ShelfFileNotFound(String),

    #[error("shelf file is still open: {0}")]
    ShelfFileOpened(String),

    #[error("shelf file is not open: {0}")]
    ShelfFileClosed(String),

    #[error("shelf file create failed: {0}")]
    ShelfFileCreateFailed(String),

    #[error("shelf file open failed: {0}")]
    ShelfFileOpenFailed(String),

    #[error("shelf file close failed: {0}")]
    ShelfFileCloseFailed(String),

    #[error("shelf file truncate failed: {0}")]
    ShelfFileTruncateFailed(String),

    #[error("shelf file rename failed: {0}")]
    ShelfFileRenameFailed(String),

    #[error("shelf file map failed: {0}")]
    ShelfFileMapFailed(String),

    #[error("shelf file unmap failed: {0}")]
    ShelfFileUnmapFailed(String),

    #[error("shelf file get permission failed: {0}")]
    ShelfFileGetPermFailed(String),

    #[error("shelf file set permission failed: {0}")]
    ShelfFileSetPermFailed(String),

    #[error("shelf file has an invalid on-shelf format: {0}")]
    ShelfFileInvalidFormat(String),

    #[error("fabric atomic region registration failed: {0}")]
    FamAtomicRegisterFailed(String),

    // regions
    #[error("region create failed: {0}")]
    RegionCreateFailed(String),

    #[error("region destroy failed: {0}")]
    RegionDestroyFailed(String),

    #[error("region open failed: {0}")]
    RegionOpenFailed(String),

    #[error("region close failed: {0}")]
    RegionCloseFailed(String),

    #[error("region map failed: {0}")]
    RegionMapFailed(String),

    #[error("region unmap failed: {0}")]
    RegionUnmapFailed(String),

    // heaps
    #[error("heap create failed: {0}")]
    HeapCreateFailed(String),

    #[error("heap destroy failed: {0}")]
    HeapDestroyFailed(String),

    #[error("heap open failed: {0}")]
    HeapOpenFailed(String),

    #[error("heap close failed: {0}")]
    HeapCloseFailed(String),

    // allocator substrates
    #[error("freelists create failed")]
    FreeListsCreateFailed,

    #[error("freelists destroy failed")]
    FreeListsDestroyFailed,

    #[error("freelists open failed")]
    FreeListsOpenFailed,

    #[error("freelists close failed")]
    FreeListsCloseFailed,

    #[error("freelist is empty")]
    FreeListsEmpty,

    #[error("ownership create failed")]
    OwnershipCreateFailed,

    #[error("ownership destroy failed")]
    OwnershipDestroyFailed,

    #[error("ownership open failed")]
    OwnershipOpenFailed,

    #[error("ownership close failed")]
    OwnershipCloseFailed,

    // pointers
    #[error("invalid global pointer: {0}")]
    InvalidPtr(GlobalPtr),

    #[error("map pointer failed: {0}")]
    MapPointerFailed(GlobalPtr),

    // epochs
    #[error("epoch participant registration failed: {0}")]
    EpochRegisterFailed(String),

    #[error("epoch vector is corrupt: {0}")]
    EpochVectorCorrupt(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, MmError>;
