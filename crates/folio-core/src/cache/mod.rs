//! Execution cache.
//!
//! A content-addressed store of executed notebooks. Committed records are
//! keyed by [`content_hash`]; staged records track a source (`uri`) that is
//! pending execution together with the hash it was staged with and the
//! traceback of its last failed attempt.
//!
//! The store is injected into the cached client, so builds use
//! [`DiskCacheStore`] and tests can use [`MemoryCacheStore`].

mod disk;
mod hash;
mod memory;

pub use disk::DiskCacheStore;
pub use hash::{content_hash, execution_key};
pub use memory::MemoryCacheStore;

use std::fs::File;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::notebook::NotebookDocument;

/// Notebook metadata keys copied from a cached notebook on merge.
pub const MERGED_METADATA_KEYS: &[&str] = &["kernelspec", "language_info", "widgets"];

/// Document-specific metadata never written to the cache.
const VOLATILE_METADATA_KEYS: &[&str] = &["source_map"];

/// A committed execution.
#[derive(Debug, Clone, PartialEq, Serialize, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CacheRecord {
    /// Content hash of the executed notebook.
    pub hash: String,

    /// Source the notebook was executed from.
    pub uri: String,

    /// POSIX timestamp of the commit.
    pub created: f64,

    /// Execution time in seconds.
    pub runtime: f64,
}

/// A source pending execution.
#[derive(Debug, Clone, PartialEq, Serialize, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagedRecord {
    /// Source identifier (path of the notebook).
    pub uri: String,

    /// [`execution_key`] at staging time. Restaging under another key
    /// discards the stored failure.
    pub hash: String,

    /// Format the source was read with, when it is not plain `.ipynb`.
    pub read_fmt: Option<String>,

    /// POSIX timestamp of staging.
    pub created: f64,

    /// Error name of the last failed execution.
    pub error: Option<String>,

    /// Traceback of the last failed execution.
    pub traceback: Option<String>,
}

impl StagedRecord {
    /// Whether a failed execution is recorded.
    pub fn has_failure(&self) -> bool {
        self.traceback.is_some()
    }
}

/// A committed record together with its executed notebook.
#[derive(Debug, Clone)]
pub struct CacheMatch {
    pub record: CacheRecord,
    pub notebook: NotebookDocument,
}

/// Exclusive execution lock on a content hash, released on drop.
#[derive(Debug)]
pub struct KeyLock {
    file: Option<File>,
}

impl KeyLock {
    /// Lock backed by an exclusively locked file.
    pub(crate) fn file(file: File) -> Self {
        Self { file: Some(file) }
    }

    /// Lock for stores that need no cross-process coordination.
    pub(crate) fn noop() -> Self {
        Self { file: None }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file
            && let Err(e) = fs2::FileExt::unlock(file)
        {
            tracing::warn!("Failed to release cache key lock: {}", e);
        }
    }
}

/// Storage of committed and staged records.
pub trait CacheStore: Send + Sync {
    /// Committed record for a content hash.
    ///
    /// Returns `Err(Error::CacheConsistency)` when a record exists but its
    /// payload cannot be used.
    fn match_notebook(&self, hash: &str) -> Result<Option<CacheMatch>>;

    /// Stage `uri` for execution with the given hash.
    ///
    /// A stored failure is kept only if the hash is unchanged.
    fn stage(&self, uri: &str, hash: &str, read_fmt: Option<&str>) -> Result<StagedRecord>;

    /// Forget the stored failure of a staged source.
    fn clear_failure(&self, uri: &str) -> Result<()>;

    /// Store a failed execution against a staged source without committing.
    fn record_failure(&self, uri: &str, error: &str, traceback: &str) -> Result<()>;

    /// Commit an executed notebook, replacing any record with the same hash.
    fn commit(
        &self,
        uri: &str,
        hash: &str,
        notebook: &NotebookDocument,
        runtime: f64,
    ) -> Result<CacheRecord>;

    /// Take the exclusive execution lock for a content hash.
    fn lock_key(&self, hash: &str) -> Result<KeyLock>;

    /// All committed records.
    fn records(&self) -> Result<Vec<CacheRecord>>;

    /// All staged records.
    fn staged_records(&self) -> Result<Vec<StagedRecord>>;

    /// Remove a staged source; returns whether it existed.
    fn unstage(&self, uri: &str) -> Result<bool>;

    /// Remove every record.
    fn clear(&self) -> Result<()>;
}

/// Shared handle to a cache store.
pub type SharedCacheStore = Arc<dyn CacheStore>;

/// Copy cached outputs into `notebook`.
///
/// Outputs and execution counts are copied positionally over code cells,
/// together with the [`MERGED_METADATA_KEYS`] of the notebook metadata. The
/// code cells of both notebooks must have identical sources.
pub fn merge_match_into(notebook: &mut NotebookDocument, cached: &CacheMatch) -> Result<()> {
    let consistency = |message: String| Error::CacheConsistency {
        key: cached.record.hash.clone(),
        message,
    };

    let targets: Vec<usize> = notebook.code_cells().map(|(i, _)| i).collect();
    let sources: Vec<usize> = cached.notebook.code_cells().map(|(i, _)| i).collect();
    if targets.len() != sources.len() {
        return Err(consistency(format!(
            "cached notebook has {} code cells, document has {}",
            sources.len(),
            targets.len()
        )));
    }
    for (&target, &source) in targets.iter().zip(&sources) {
        if notebook.cells[target].source != cached.notebook.cells[source].source {
            return Err(consistency(format!("code cell {target} differs from cached source")));
        }
    }

    for (&target, &source) in targets.iter().zip(&sources) {
        let cached_cell = &cached.notebook.cells[source];
        let cell = &mut notebook.cells[target];
        cell.outputs = cached_cell.outputs.clone();
        cell.execution_count = cached_cell.execution_count;
    }
    for key in MERGED_METADATA_KEYS {
        match cached.notebook.metadata.get(*key) {
            Some(value) if !value.is_null() => {
                notebook.metadata.insert(key.to_string(), value.clone());
            }
            _ => {}
        }
    }
    Ok(())
}

/// Staged record update shared by store implementations.
pub(crate) fn restage(
    existing: Option<StagedRecord>,
    uri: &str,
    hash: &str,
    read_fmt: Option<&str>,
) -> StagedRecord {
    match existing {
        Some(mut record) if record.hash == hash => {
            record.read_fmt = read_fmt.map(str::to_string);
            record
        }
        _ => StagedRecord {
            uri: uri.to_string(),
            hash: hash.to_string(),
            read_fmt: read_fmt.map(str::to_string),
            created: crate::unix_timestamp(),
            error: None,
            traceback: None,
        },
    }
}

/// Drop volatile metadata from a notebook before it is stored.
pub(crate) fn strip_volatile(notebook: &NotebookDocument) -> NotebookDocument {
    let mut stored = notebook.clone();
    stored
        .metadata
        .retain(|key, _| !VOLATILE_METADATA_KEYS.contains(&key.as_str()));
    stored
}
