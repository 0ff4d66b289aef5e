//! Directory-backed cache store.
//!
//! Records are kept in an rkyv snapshot (`index.bin`) that is rewritten
//! atomically (temp file, then rename) under an exclusive lock on
//! `index.lock`. Executed notebooks live next to it as `.ipynb` payloads.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rkyv::rancor;

use crate::error::{Error, Result};
use crate::notebook::{NotebookDocument, read_notebook, write_notebook};
use crate::paths::CacheDirs;

use super::{
    CacheMatch, CacheRecord, CacheStore, KeyLock, StagedRecord, restage, strip_volatile,
};

/// Current index format version.
///
/// Indexes written with another version are rejected.
pub const INDEX_VERSION: u32 = 1;

/// Persisted index of records.
#[derive(Debug, Clone, Default, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct CacheIndex {
    version: u32,
    records: Vec<CacheRecord>,
    staged: Vec<StagedRecord>,
}

/// Cache store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    dirs: CacheDirs,
}

impl DiskCacheStore {
    /// Open (creating if needed) the cache at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let dirs = CacheDirs::create(root)?;
        tracing::debug!("Opened cache at {}", dirs.root.display());
        Ok(Self { dirs })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.dirs.root
    }

    /// Path of the executed notebook for a hash.
    pub fn payload_path(&self, hash: &str) -> PathBuf {
        self.dirs.executed_file(hash)
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Cache(format!("failed to open lock file {}: {}", path.display(), e)))
    }

    /// Run `f` on the index under a shared lock.
    fn read_index<T>(&self, f: impl FnOnce(&CacheIndex) -> Result<T>) -> Result<T> {
        let lock = Self::open_lock_file(&self.dirs.index_lock_file())?;
        lock.lock_shared()?;
        let result = self.load_index().and_then(|index| f(&index));
        let _ = FileExt::unlock(&lock);
        result
    }

    /// Read-modify-write the index under an exclusive lock.
    fn update_index<T>(&self, f: impl FnOnce(&mut CacheIndex) -> Result<T>) -> Result<T> {
        let lock = Self::open_lock_file(&self.dirs.index_lock_file())?;
        lock.lock_exclusive()?;
        let result = self.load_index().and_then(|mut index| {
            let value = f(&mut index)?;
            self.save_index(&index)?;
            Ok(value)
        });
        let _ = FileExt::unlock(&lock);
        result
    }

    fn load_index(&self) -> Result<CacheIndex> {
        let path = self.dirs.index_file();
        if !path.exists() {
            return Ok(CacheIndex {
                version: INDEX_VERSION,
                ..CacheIndex::default()
            });
        }

        let bytes = fs::read(&path)?;
        let archived = rkyv::access::<ArchivedCacheIndex, rancor::Error>(&bytes)
            .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?;

        let found: u32 = archived.version.into();
        if found != INDEX_VERSION {
            return Err(Error::Cache(format!(
                "cache index version mismatch: expected {}, found {}",
                INDEX_VERSION, found
            )));
        }

        rkyv::deserialize::<CacheIndex, rancor::Error>(archived)
            .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))
    }

    fn save_index(&self, index: &CacheIndex) -> Result<()> {
        let bytes = rkyv::to_bytes::<rancor::Error>(index)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let path = self.dirs.index_file();
        write_atomic(&path, &bytes)?;

        tracing::debug!(
            "Saved cache index: {} records, {} staged, {} bytes",
            index.records.len(),
            index.staged.len(),
            bytes.len()
        );
        Ok(())
    }
}

/// Write a file through a temporary sibling and rename it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl CacheStore for DiskCacheStore {
    fn match_notebook(&self, hash: &str) -> Result<Option<CacheMatch>> {
        let record = self.read_index(|index| {
            Ok(index.records.iter().find(|r| r.hash == hash).cloned())
        })?;
        let Some(record) = record else {
            return Ok(None);
        };

        let payload = self.payload_path(hash);
        let notebook = read_notebook(&payload).map_err(|e| Error::CacheConsistency {
            key: hash.to_string(),
            message: format!("executed notebook {} unreadable: {}", payload.display(), e),
        })?;
        Ok(Some(CacheMatch { record, notebook }))
    }

    fn stage(&self, uri: &str, hash: &str, read_fmt: Option<&str>) -> Result<StagedRecord> {
        self.update_index(|index| {
            let position = index.staged.iter().position(|r| r.uri == uri);
            let existing = position.map(|i| index.staged.remove(i));
            let record = restage(existing, uri, hash, read_fmt);
            index.staged.push(record.clone());
            Ok(record)
        })
    }

    fn clear_failure(&self, uri: &str) -> Result<()> {
        self.update_index(|index| {
            if let Some(record) = index.staged.iter_mut().find(|r| r.uri == uri) {
                record.error = None;
                record.traceback = None;
            }
            Ok(())
        })
    }

    fn record_failure(&self, uri: &str, error: &str, traceback: &str) -> Result<()> {
        self.update_index(|index| {
            let record = index
                .staged
                .iter_mut()
                .find(|r| r.uri == uri)
                .ok_or_else(|| Error::Cache(format!("{uri} is not staged")))?;
            record.error = Some(error.to_string());
            record.traceback = Some(traceback.to_string());
            Ok(())
        })
    }

    fn commit(
        &self,
        uri: &str,
        hash: &str,
        notebook: &NotebookDocument,
        runtime: f64,
    ) -> Result<CacheRecord> {
        // Payload first, so a visible record always has its notebook.
        let payload = self.payload_path(hash);
        let temp = payload.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        write_notebook(&strip_volatile(notebook), &temp)?;
        fs::rename(&temp, &payload)?;

        let record = CacheRecord {
            hash: hash.to_string(),
            uri: uri.to_string(),
            created: crate::unix_timestamp(),
            runtime,
        };
        self.update_index(|index| {
            index.records.retain(|r| r.hash != hash);
            index.records.push(record.clone());
            if let Some(staged) = index.staged.iter_mut().find(|r| r.uri == uri) {
                staged.hash = hash.to_string();
                staged.error = None;
                staged.traceback = None;
            }
            Ok(())
        })?;
        Ok(record)
    }

    fn lock_key(&self, hash: &str) -> Result<KeyLock> {
        let file = Self::open_lock_file(&self.dirs.key_lock_file(hash))?;
        file.lock_exclusive()
            .map_err(|e| Error::Cache(format!("failed to lock cache key {hash}: {e}")))?;
        Ok(KeyLock::file(file))
    }

    fn records(&self) -> Result<Vec<CacheRecord>> {
        self.read_index(|index| Ok(index.records.clone()))
    }

    fn staged_records(&self) -> Result<Vec<StagedRecord>> {
        self.read_index(|index| Ok(index.staged.clone()))
    }

    fn unstage(&self, uri: &str) -> Result<bool> {
        self.update_index(|index| {
            let before = index.staged.len();
            index.staged.retain(|r| r.uri != uri);
            Ok(index.staged.len() != before)
        })
    }

    fn clear(&self) -> Result<()> {
        let lock = Self::open_lock_file(&self.dirs.index_lock_file())?;
        lock.lock_exclusive()?;
        let result = fs::remove_dir_all(&self.dirs.executed_dir)
            .or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
            .and_then(|()| fs::create_dir_all(&self.dirs.executed_dir))
            .map_err(Error::from)
            .and_then(|()| {
                self.save_index(&CacheIndex {
                    version: INDEX_VERSION,
                    ..CacheIndex::default()
                })
            });
        let _ = FileExt::unlock(&lock);
        tracing::info!("Cleared cache at {}", self.dirs.root.display());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::content_hash;
    use crate::notebook::{Cell, Output};
    use tempfile::TempDir;

    fn executed() -> NotebookDocument {
        let mut nb = NotebookDocument::with_cells(vec![Cell::code("print(1)")]);
        nb.cells[0].outputs.push(Output::stdout("1\n"));
        nb.cells[0].execution_count = Some(1);
        nb
    }

    #[test]
    fn test_commit_then_match() {
        let temp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(temp.path().join("cache")).unwrap();
        let nb = executed();
        let hash = content_hash(&nb);

        assert!(store.match_notebook(&hash).unwrap().is_none());
        store.stage("nb.ipynb", &hash, None).unwrap();
        let record = store.commit("nb.ipynb", &hash, &nb, 0.25).unwrap();

        let found = store.match_notebook(&hash).unwrap().unwrap();
        assert_eq!(found.record, record);
        assert_eq!(found.notebook.cells[0].outputs, nb.cells[0].outputs);
    }

    #[test]
    fn test_index_persists_across_opens() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let nb = executed();
        let hash = content_hash(&nb);

        {
            let store = DiskCacheStore::open(&root).unwrap();
            store.stage("a.ipynb", &hash, None).unwrap();
            store.commit("a.ipynb", &hash, &nb, 1.0).unwrap();
            store.stage("b.ipynb", "other", None).unwrap();
            store.record_failure("b.ipynb", "ZeroDivisionError", "tb").unwrap();
        }

        let store = DiskCacheStore::open(&root).unwrap();
        assert_eq!(store.records().unwrap().len(), 1);
        let staged = store.staged_records().unwrap();
        let b = staged.iter().find(|r| r.uri == "b.ipynb").unwrap();
        assert_eq!(b.error.as_deref(), Some("ZeroDivisionError"));
    }

    #[test]
    fn test_commit_overwrites_same_hash() {
        let temp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(temp.path()).unwrap();
        let nb = executed();
        let hash = content_hash(&nb);

        store.commit("a.ipynb", &hash, &nb, 1.0).unwrap();
        store.commit("a.ipynb", &hash, &nb, 2.0).unwrap();

        let records = store.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].runtime, 2.0);
    }

    #[test]
    fn test_missing_payload_is_consistency_error() {
        let temp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(temp.path()).unwrap();
        let nb = executed();
        let hash = content_hash(&nb);
        store.commit("a.ipynb", &hash, &nb, 1.0).unwrap();

        fs::remove_file(store.payload_path(&hash)).unwrap();
        let result = store.match_notebook(&hash);
        assert!(matches!(result, Err(Error::CacheConsistency { .. })));
    }

    #[test]
    fn test_unstage_and_clear() {
        let temp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(temp.path()).unwrap();
        let nb = executed();
        let hash = content_hash(&nb);

        store.stage("a.ipynb", &hash, None).unwrap();
        assert!(store.unstage("a.ipynb").unwrap());
        assert!(!store.unstage("a.ipynb").unwrap());

        store.commit("a.ipynb", &hash, &nb, 1.0).unwrap();
        store.clear().unwrap();
        assert!(store.records().unwrap().is_empty());
        assert!(!store.payload_path(&hash).exists());
    }

    #[test]
    fn test_key_lock_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(temp.path()).unwrap();
        {
            let _lock = store.lock_key("abc").unwrap();
        }
        let _again = store.lock_key("abc").unwrap();
    }
}
