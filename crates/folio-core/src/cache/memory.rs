//! In-memory cache store.

use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::notebook::NotebookDocument;

use super::{
    CacheMatch, CacheRecord, CacheStore, KeyLock, StagedRecord, restage, strip_volatile,
};

#[derive(Debug, Default)]
struct State {
    records: Vec<CacheRecord>,
    payloads: FxHashMap<String, NotebookDocument>,
    staged: Vec<StagedRecord>,
    commits: usize,
}

/// Cache store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    state: Mutex<State>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits performed.
    pub fn commit_count(&self) -> usize {
        self.state().map(|s| s.commits).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Cache("memory cache poisoned".to_string()))
    }
}

impl CacheStore for MemoryCacheStore {
    fn match_notebook(&self, hash: &str) -> Result<Option<CacheMatch>> {
        let state = self.state()?;
        let Some(record) = state.records.iter().find(|r| r.hash == hash).cloned() else {
            return Ok(None);
        };
        let notebook = state
            .payloads
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::CacheConsistency {
                key: hash.to_string(),
                message: "record has no executed notebook".to_string(),
            })?;
        Ok(Some(CacheMatch { record, notebook }))
    }

    fn stage(&self, uri: &str, hash: &str, read_fmt: Option<&str>) -> Result<StagedRecord> {
        let mut state = self.state()?;
        let position = state.staged.iter().position(|r| r.uri == uri);
        let existing = position.map(|i| state.staged.remove(i));
        let record = restage(existing, uri, hash, read_fmt);
        state.staged.push(record.clone());
        Ok(record)
    }

    fn clear_failure(&self, uri: &str) -> Result<()> {
        let mut state = self.state()?;
        if let Some(record) = state.staged.iter_mut().find(|r| r.uri == uri) {
            record.error = None;
            record.traceback = None;
        }
        Ok(())
    }

    fn record_failure(&self, uri: &str, error: &str, traceback: &str) -> Result<()> {
        let mut state = self.state()?;
        let record = state
            .staged
            .iter_mut()
            .find(|r| r.uri == uri)
            .ok_or_else(|| Error::Cache(format!("{uri} is not staged")))?;
        record.error = Some(error.to_string());
        record.traceback = Some(traceback.to_string());
        Ok(())
    }

    fn commit(
        &self,
        uri: &str,
        hash: &str,
        notebook: &NotebookDocument,
        runtime: f64,
    ) -> Result<CacheRecord> {
        let mut state = self.state()?;
        let record = CacheRecord {
            hash: hash.to_string(),
            uri: uri.to_string(),
            created: crate::unix_timestamp(),
            runtime,
        };
        state.records.retain(|r| r.hash != hash);
        state.records.push(record.clone());
        state
            .payloads
            .insert(hash.to_string(), strip_volatile(notebook));
        if let Some(staged) = state.staged.iter_mut().find(|r| r.uri == uri) {
            staged.hash = hash.to_string();
            staged.error = None;
            staged.traceback = None;
        }
        state.commits += 1;
        Ok(record)
    }

    fn lock_key(&self, _hash: &str) -> Result<KeyLock> {
        Ok(KeyLock::noop())
    }

    fn records(&self) -> Result<Vec<CacheRecord>> {
        Ok(self.state()?.records.clone())
    }

    fn staged_records(&self) -> Result<Vec<StagedRecord>> {
        Ok(self.state()?.staged.clone())
    }

    fn unstage(&self, uri: &str) -> Result<bool> {
        let mut state = self.state()?;
        let before = state.staged.len();
        state.staged.retain(|r| r.uri != uri);
        Ok(state.staged.len() != before)
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state()?;
        *state = State::default();
        Ok(())
    }
}
