//! Client selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    CachedClient, ClientBase, DirectClient, ExecutionClient, ExecutionSession, InlineClient,
    ReadOnlyClient,
};
use crate::cache::{DiskCacheStore, SharedCacheStore};
use crate::config::{ExecutionConfig, ExecutionMode};
use crate::error::{Error, Result};
use crate::glob::path_matches;
use crate::kernel::{ProcessKernelLauncher, SharedLauncher};
use crate::logger::{LogContext, SharedLogger};
use crate::notebook::NotebookDocument;

/// Collaborators injected into the clients.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Document logger.
    pub logger: SharedLogger,

    /// Starts kernels for executing clients.
    pub launcher: SharedLauncher,

    /// Cache store for mode `cache`; opened from the configuration when unset.
    pub cache: Option<SharedCacheStore>,

    /// Base directory for a relative or default cache path.
    pub build_root: PathBuf,

    /// Reader format of the source, recorded on staged cache entries.
    pub read_fmt: Option<String>,

    /// Directory for traceback reports; `<cache path>/reports` when unset.
    pub reports_dir: Option<PathBuf>,
}

impl ExecutionContext {
    /// Context using real kernels and the current directory as build root.
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            logger,
            launcher: Arc::new(ProcessKernelLauncher::new()),
            cache: None,
            build_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            read_fmt: None,
            reports_dir: None,
        }
    }

    pub fn with_launcher(mut self, launcher: SharedLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_cache(mut self, cache: SharedCacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_build_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.build_root = root.into();
        self
    }

    pub fn with_read_fmt(mut self, read_fmt: impl Into<String>) -> Self {
        self.read_fmt = Some(read_fmt.into());
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Traceback report of a document, mirroring its path under the build root.
    pub fn report_path(&self, config: &ExecutionConfig, source: Option<&Path>) -> PathBuf {
        let dir = self
            .reports_dir
            .clone()
            .unwrap_or_else(|| config.resolve_cache_path(&self.build_root).join("reports"));
        let root = self
            .build_root
            .canonicalize()
            .unwrap_or_else(|_| self.build_root.clone());
        let relative = match source {
            Some(path) => match path.strip_prefix(&root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("notebook")),
            },
            None => PathBuf::from("notebook"),
        };
        dir.join(relative).with_extension("err.log")
    }

    fn cache_store(&self, config: &ExecutionConfig) -> Result<SharedCacheStore> {
        match &self.cache {
            Some(cache) => Ok(cache.clone()),
            None => {
                let root = config.resolve_cache_path(&self.build_root);
                Ok(Arc::new(DiskCacheStore::open(root)?))
            }
        }
    }
}

/// Select, create and start the client for a notebook.
///
/// `source` identifies where the notebook came from; it is treated as a path
/// only when it names an existing file. Selection order: exclusion patterns,
/// then the `auto` skip for fully executed notebooks, then the mode.
pub fn create_client(
    notebook: NotebookDocument,
    source: &str,
    config: &ExecutionConfig,
    ctx: &ExecutionContext,
) -> Result<ExecutionSession> {
    let config = config.with_notebook_overrides(&notebook, ctx.logger.as_ref());
    config.validate()?;
    let path = resolve_source(source);
    let exec_ctx = LogContext::subtype("exec");

    let mut mode = config.mode;
    if let Some(path) = &path
        && let Some(pattern) = config
            .exclude_patterns
            .iter()
            .find(|pattern| path_matches(path, pattern))
    {
        ctx.logger.info(
            &format!("Excluded from execution by pattern: {pattern:?}"),
            &exec_ctx,
        );
        mode = ExecutionMode::Off;
    }
    if mode == ExecutionMode::Auto && notebook.all_code_cells_have_outputs() {
        ctx.logger.info(
            "Skipped execution in 'auto' mode (all outputs present)",
            &exec_ctx,
        );
        mode = ExecutionMode::Off;
    }

    let executes_at_once = matches!(
        mode,
        ExecutionMode::Auto | ExecutionMode::Force | ExecutionMode::Inline
    );
    if executes_at_once && path.is_none() && !config.in_temp {
        return Err(Error::Configuration(format!(
            "Input source must exist as file, if execution_in_temp=false and execution_mode is '{}'",
            mode
        )));
    }

    let report = ctx.report_path(&config, path.as_deref());
    let base = ClientBase::new(notebook, path, config, ctx.logger.clone())?.with_report_path(Some(report));
    let client: Box<dyn ExecutionClient> = match mode {
        ExecutionMode::Off => Box::new(ReadOnlyClient::new(base)),
        ExecutionMode::Auto | ExecutionMode::Force => {
            Box::new(DirectClient::new(base, ctx.launcher.clone()))
        }
        ExecutionMode::Cache => {
            let store = ctx.cache_store(base.config())?;
            Box::new(CachedClient::new(
                base,
                ctx.launcher.clone(),
                store,
                ctx.read_fmt.clone(),
            ))
        }
        ExecutionMode::Inline => Box::new(InlineClient::new(base, ctx.launcher.clone())),
    };
    tracing::debug!("Opening {} execution client for {}", client.kind(), source);
    ExecutionSession::open(client)
}

/// Absolute path of `source` when it names an existing file.
fn resolve_source(source: &str) -> Option<PathBuf> {
    let path = Path::new(source);
    if !path.is_file() {
        return None;
    }
    Some(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}
