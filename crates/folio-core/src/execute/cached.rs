//! Execution backed by the cache.

use super::runner::execute_notebook;
use super::workdir::WorkDir;
use super::{ClientBase, ClientKind, ExecutionClient, ExecutionResult};
use crate::cache::{SharedCacheStore, content_hash, execution_key, merge_match_into};
use crate::config::ExecutionMode;
use crate::error::{Error, Result};
use crate::kernel::SharedLauncher;
use crate::logger::LogContext;

/// Restores committed outputs, executing and committing on a miss.
pub struct CachedClient {
    base: ClientBase,
    launcher: SharedLauncher,
    store: SharedCacheStore,
    read_fmt: Option<String>,
}

impl CachedClient {
    pub(crate) fn new(
        base: ClientBase,
        launcher: SharedLauncher,
        store: SharedCacheStore,
        read_fmt: Option<String>,
    ) -> Self {
        Self {
            base,
            launcher,
            store,
            read_fmt,
        }
    }

    fn warn(&self, message: &str) {
        self.base
            .logger
            .warning(message, &LogContext::subtype("cache"));
    }

    /// Merge the committed record for `hash` into the notebook.
    ///
    /// Unusable records are reported and treated as a miss.
    fn restore(&mut self, hash: &str) -> Lookup {
        let cached = match self.store.match_notebook(hash) {
            Ok(Some(cached)) => cached,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                self.warn(&format!("Failed to read cached notebook: ID={hash}: {}", e.with_hint()));
                return Lookup::Unusable;
            }
        };
        if let Err(e) = merge_match_into(&mut self.base.notebook, &cached) {
            self.warn(&format!("Cached notebook could not be merged: ID={hash}: {}", e.with_hint()));
            return Lookup::Unusable;
        }

        self.base.logger.info(
            &format!("Using cached notebook: ID={hash}"),
            &LogContext::subtype("cache"),
        );
        self.base.exec_metadata = Some(ExecutionResult::success_at(
            ExecutionMode::Cache,
            Some(cached.record.runtime),
            cached.record.created,
        ));
        Lookup::Hit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Hit,
    Miss,
    /// A record exists but cannot be used.
    Unusable,
}

impl ExecutionClient for CachedClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Cached
    }

    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ClientBase {
        &mut self.base
    }

    fn start(&mut self) -> Result<()> {
        let hash = content_hash(&self.base.notebook);
        let first = self.restore(&hash);
        if first == Lookup::Hit {
            return Ok(());
        }

        let uri = match &self.base.path {
            Some(path) => path.display().to_string(),
            None => {
                return Err(Error::Configuration(
                    "Input source must exist as file, if execution_mode is 'cache'".to_string(),
                ));
            }
        };

        let _lock = match self.store.lock_key(&hash) {
            Ok(lock) => Some(lock),
            Err(e) => {
                self.warn(&format!("Failed to lock cache key: ID={hash}: {e}"));
                None
            }
        };
        // Another build may have committed while we waited for the lock.
        if first == Lookup::Miss && self.restore(&hash) == Lookup::Hit {
            return Ok(());
        }

        // Failures are stored per execution key, so changing a setting that
        // may avoid the failure retries the notebook.
        let key = execution_key(&self.base.notebook, &self.base.config);
        match self.store.stage(&uri, &key, self.read_fmt.as_deref()) {
            Ok(staged) if staged.has_failure() => {
                self.base.logger.info(
                    &format!("Using stored failure for unchanged notebook: {uri}"),
                    &LogContext::subtype("cache"),
                );
                let result = ExecutionResult::failure(
                    ExecutionMode::Cache,
                    None,
                    staged.error.unwrap_or_else(|| "ExecutionError".to_string()),
                    staged.traceback.unwrap_or_default(),
                );
                return self.base.conclude(result);
            }
            Ok(_) => {
                if let Err(e) = self.store.clear_failure(&uri) {
                    self.warn(&format!("Failed to update staged notebook {uri}: {e}"));
                }
            }
            Err(e) => self.warn(&format!("Failed to stage notebook {uri}: {}", e.with_hint())),
        }

        let base = &mut self.base;
        let workdir = WorkDir::for_source(&base.config, base.path.as_deref())?;
        base.logger.info(
            &format!("Executing notebook using {} CWD", workdir.kind()),
            &LogContext::subtype("exec"),
        );
        let (runtime, failure) = execute_notebook(
            self.launcher.as_ref(),
            &mut base.notebook,
            &base.config,
            workdir.path(),
            base.logger.as_ref(),
        );
        drop(workdir);

        let result = match failure {
            None => {
                match self.store.commit(&uri, &hash, &self.base.notebook, runtime) {
                    Ok(_) => self.base.logger.info(
                        &format!("Cached executed notebook: ID={hash}"),
                        &LogContext::subtype("cache"),
                    ),
                    Err(e) => self.warn(&format!(
                        "Failed to cache executed notebook: ID={hash}: {}",
                        e.with_hint()
                    )),
                }
                ExecutionResult::success(ExecutionMode::Cache, Some(runtime))
            }
            Some(failure) => {
                if failure.environmental {
                    tracing::debug!("Not storing {} for {}: the kernel was unavailable", failure.ename, uri);
                } else if let Err(e) = self.store.record_failure(&uri, &failure.ename, &failure.traceback) {
                    self.warn(&format!("Failed to record failure for {uri}: {e}"));
                }
                ExecutionResult::failure(
                    ExecutionMode::Cache,
                    Some(runtime),
                    failure.ename,
                    failure.traceback,
                )
            }
        };
        self.base.conclude(result)
    }
}
