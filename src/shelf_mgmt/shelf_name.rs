// Shelf path derivation
//
// Every shelf of every pool lives under one deterministic name:
// `<shelf_base>/<shelf_user>_NVMM_Shelf_<pool>_<shelf>[_suffix]`.
// Keeping the scheme in one place lets any process reconstruct a shelf path
// from nothing but its id.

use std::path::PathBuf;

use crate::config::Config;
use crate::shelf_id::ShelfId;

#[derive(Debug, Clone)]
pub struct ShelfName {
    prefix: String,
}

impl ShelfName {
    pub fn new(config: &Config) -> Self {
        Self {
            prefix: config.shelf_prefix().to_string_lossy().into_owned(),
        }
    }

    pub fn path(&self, shelf_id: ShelfId) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}_{}",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_index()
        ))
    }

    pub fn path_with_suffix(&self, shelf_id: ShelfId, suffix: &str) -> PathBuf {
        debug_assert!(!suffix.is_empty());
        PathBuf::from(format!(
            "{}_{}_{}_{}",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_index(),
            suffix
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_shape() {
        let config = Config::new("/lfs", "alice");
        let names = ShelfName::new(&config);
        assert_eq!(
            names.path(ShelfId::new(3, 7)),
            PathBuf::from("/lfs/alice_NVMM_Shelf_3_7")
        );
        assert_eq!(
            names.path_with_suffix(ShelfId::new(1, 0), "pool"),
            PathBuf::from("/lfs/alice_NVMM_Shelf_1_0_pool")
        );
    }
}
