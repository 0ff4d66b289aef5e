//! Cache directory management.
//!
//! Provides a consistent on-disk layout for the execution cache, shared by the
//! cache store, the CLI administration commands and tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default name of the cache directory, created next to the build root.
pub const DEFAULT_CACHE_DIR: &str = ".folio_cache";

/// Directory structure of an execution cache.
///
/// ```text
/// .folio_cache/
/// ├── index.bin    # rkyv snapshot of committed and staged records
/// ├── index.lock   # guards read-modify-write of the index
/// ├── executed/    # executed notebook payloads, one per content hash
/// └── locks/       # per content hash execution locks
/// ```
#[derive(Debug, Clone)]
pub struct CacheDirs {
    /// The cache root itself.
    pub root: PathBuf,

    /// Executed notebook payloads.
    pub executed_dir: PathBuf,

    /// Per-key lock files.
    pub locks_dir: PathBuf,
}

impl CacheDirs {
    /// Create the directory structure under `root`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dirs = Self {
            executed_dir: root.join("executed"),
            locks_dir: root.join("locks"),
            root,
        };
        fs::create_dir_all(&dirs.executed_dir)?;
        fs::create_dir_all(&dirs.locks_dir)?;
        Ok(dirs)
    }

    /// Path of the record index.
    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.bin")
    }

    /// Path of the index lock file.
    pub fn index_lock_file(&self) -> PathBuf {
        self.root.join("index.lock")
    }

    /// Path of the executed notebook stored for a hash.
    pub fn executed_file(&self, hash: &str) -> PathBuf {
        self.executed_dir.join(format!("{hash}.ipynb"))
    }

    /// Path of the execution lock for a hash.
    pub fn key_lock_file(&self, hash: &str) -> PathBuf {
        self.locks_dir.join(format!("{hash}.lock"))
    }

    /// Remove everything and recreate the empty structure.
    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.executed_dir)?;
        fs::create_dir_all(&self.locks_dir)?;
        Ok(())
    }
}

/// Cache directory used when none is configured.
pub fn default_cache_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_CACHE_DIR)
}
