// Process-wide configuration
//
// Recognized settings: the backing filesystem root (`shelf_base`), the
// namespace prefix inserted into every shelf filename (`shelf_user`), and the
// device page size used for alignment. All shelf paths are derived here so
// the rest of the crate never concatenates path strings itself.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MmError, Result};

const DEFAULT_SHELF_BASE: &str = "/dev/shm";
const DEFAULT_SHELF_USER: &str = "global";

#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute path of the backing filesystem root.
    pub shelf_base: PathBuf,
    /// Namespace prefix inserted into every shelf filename.
    pub shelf_user: String,
    /// Device page size; file lengths and mapping extents are multiples of it.
    pub page_size: u64,
}

/// On-disk form of the optional config file; every field may be omitted.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    shelf_base: Option<PathBuf>,
    shelf_user: Option<String>,
    page_size: Option<u64>,
}

pub(crate) fn device_page_size() -> u64 {
    // Safety: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_SHELF_BASE, DEFAULT_SHELF_USER)
    }
}

impl Config {
    pub fn new(shelf_base: impl Into<PathBuf>, shelf_user: impl Into<String>) -> Self {
        Self {
            shelf_base: shelf_base.into(),
            shelf_user: shelf_user.into(),
            page_size: device_page_size(),
        }
    }

    /// Builds a config from `SHELFMEM_BASE` / `SHELFMEM_USER`, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Self {
        let base = std::env::var("SHELFMEM_BASE").unwrap_or_else(|_| DEFAULT_SHELF_BASE.into());
        let user = std::env::var("SHELFMEM_USER").unwrap_or_else(|_| DEFAULT_SHELF_USER.into());
        Self::new(base, user)
    }

    /// Loads settings from a JSON file, keeping defaults for omitted fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let file: ConfigFile = serde_json::from_str(&text)
            .map_err(|e| MmError::InvalidArgument(format!("config parse error: {e}")))?;
        let mut config = Config::default();
        if let Some(base) = file.shelf_base {
            config.shelf_base = base;
        }
        if let Some(user) = file.shelf_user {
            config.shelf_user = user;
        }
        if let Some(page_size) = file.page_size {
            if !page_size.is_power_of_two() {
                return Err(MmError::InvalidArgument(format!(
                    "page_size {page_size} is not a power of two"
                )));
            }
            config.page_size = page_size;
        }
        Ok(config)
    }

    /// `<shelf_base>/<shelf_user>_NVMM_ROOT`
    pub fn root_shelf_path(&self) -> PathBuf {
        self.shelf_base
            .join(format!("{}_NVMM_ROOT", self.shelf_user))
    }

    /// `<shelf_base>/<shelf_user>_NVMM_EPOCH`
    pub fn epoch_shelf_path(&self) -> PathBuf {
        self.shelf_base
            .join(format!("{}_NVMM_EPOCH", self.shelf_user))
    }

    /// Common prefix of every pool shelf: `<shelf_base>/<shelf_user>_NVMM_Shelf`.
    pub fn shelf_prefix(&self) -> PathBuf {
        self.shelf_base
            .join(format!("{}_NVMM_Shelf", self.shelf_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = Config::new("/lfs", "alice");
        assert_eq!(config.root_shelf_path(), PathBuf::from("/lfs/alice_NVMM_ROOT"));
        assert_eq!(
            config.epoch_shelf_path(),
            PathBuf::from("/lfs/alice_NVMM_EPOCH")
        );
        assert_eq!(config.shelf_prefix(), PathBuf::from("/lfs/alice_NVMM_Shelf"));
    }

    #[test]
    fn test_page_size_sane() {
        let config = Config::default();
        assert!(config.page_size.is_power_of_two());
        assert!(config.page_size >= 4096);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mm.json");
        std::fs::write(&path, r#"{"shelf_user": "bob"}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.shelf_user, "bob");
        assert_eq!(config.shelf_base, PathBuf::from(DEFAULT_SHELF_BASE));
    }

    #[test]
    fn test_load_rejects_bad_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mm.json");
        std::fs::write(&path, r#"{"page_size": 1000}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
