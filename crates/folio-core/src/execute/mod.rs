//! Execution clients.
//!
//! A client owns one notebook for the duration of a document build. It is
//! opened through [`create_client`], which picks the strategy from the
//! configuration and the notebook state:
//!
//! - [`ReadOnlyClient`] never executes (mode `off`, excluded or already
//!   executed in mode `auto`).
//! - [`DirectClient`] executes every cell on a fresh kernel at start.
//! - [`CachedClient`] restores outputs from a [`CacheStore`](crate::cache::CacheStore)
//!   and executes only on a miss.
//! - [`InlineClient`] executes cells lazily as the renderer asks for them and
//!   can evaluate expressions against the live kernel.
//!
//! Every client produces exactly one [`ExecutionResult`], except the
//! read-only client, which produces none.

mod cached;
mod direct;
mod inline;
mod orchestrator;
mod readonly;
mod runner;
mod session;
mod workdir;

pub use cached::CachedClient;
pub use direct::DirectClient;
pub use inline::InlineClient;
pub use orchestrator::{ExecutionContext, create_client};
pub use readonly::ReadOnlyClient;
pub use runner::CellFailure;
pub use session::{ExecutionOutcome, ExecutionSession};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{ExecutionConfig, ExecutionMode};
use crate::error::{Error, Result};
use crate::logger::{LogContext, SharedLogger};
use crate::notebook::{GlueData, Metadata, NotebookDocument, Output};

/// Line offset used for cells when the notebook has no source map.
const CELL_LINE_STRIDE: usize = 10_000;

/// Outcome of executing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// POSIX timestamp of the execution.
    pub mtime: f64,

    /// Execution time in seconds.
    pub runtime: Option<f64>,

    /// Mode that produced the outputs.
    pub method: ExecutionMode,

    pub succeeded: bool,

    /// Error kind name; set exactly when `succeeded` is false.
    pub error: Option<String>,

    pub traceback: Option<String>,
}

impl ExecutionResult {
    /// Successful execution finishing now.
    pub fn success(method: ExecutionMode, runtime: Option<f64>) -> Self {
        Self::success_at(method, runtime, crate::unix_timestamp())
    }

    /// Successful execution with an explicit timestamp.
    pub fn success_at(method: ExecutionMode, runtime: Option<f64>, mtime: f64) -> Self {
        Self {
            mtime,
            runtime,
            method,
            succeeded: true,
            error: None,
            traceback: None,
        }
    }

    /// Failed execution finishing now.
    pub fn failure(
        method: ExecutionMode,
        runtime: Option<f64>,
        error: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            mtime: crate::unix_timestamp(),
            runtime,
            method,
            succeeded: false,
            error: Some(error.into()),
            traceback: Some(traceback.into()),
        }
    }
}

/// Which client the orchestrator selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    ReadOnly,
    Direct,
    Cached,
    Inline,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientKind::ReadOnly => "read-only",
            ClientKind::Direct => "direct",
            ClientKind::Cached => "cached",
            ClientKind::Inline => "inline",
        };
        f.write_str(name)
    }
}

/// State shared by every client.
pub struct ClientBase {
    pub(crate) notebook: NotebookDocument,
    pub(crate) path: Option<PathBuf>,
    pub(crate) config: ExecutionConfig,
    pub(crate) logger: SharedLogger,
    pub(crate) glue_data: GlueData,
    pub(crate) exec_metadata: Option<ExecutionResult>,
    pub(crate) cell_lines: Vec<usize>,
    /// File receiving the traceback of a failed execution.
    pub(crate) report_path: Option<PathBuf>,
}

impl ClientBase {
    /// Fails when the notebook's source map is invalid.
    pub(crate) fn new(
        notebook: NotebookDocument,
        path: Option<PathBuf>,
        config: ExecutionConfig,
        logger: SharedLogger,
    ) -> Result<Self> {
        let cell_lines = match notebook.source_map()? {
            Some(map) => map.iter().take(notebook.cells.len()).map(|line| line + 1).collect(),
            None => (0..notebook.cells.len())
                .map(|i| (i + 1) * CELL_LINE_STRIDE + 1)
                .collect(),
        };
        Ok(Self {
            notebook,
            path,
            config,
            logger,
            glue_data: GlueData::default(),
            exec_metadata: None,
            cell_lines,
            report_path: None,
        })
    }

    pub(crate) fn with_report_path(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    /// Where the traceback of a failed execution is written.
    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    /// Write `traceback` to the report file; returns the path written.
    fn write_report(&self, traceback: &str) -> Option<&Path> {
        let path = self.report_path.as_deref()?;
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(path, traceback));
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                self.logger.warning(
                    &format!("Failed to write traceback to {}: {e}", path.display()),
                    &LogContext::subtype("exec"),
                );
                None
            }
        }
    }

    pub fn notebook(&self) -> &NotebookDocument {
        &self.notebook
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Source line of a cell.
    pub fn cell_line(&self, index: usize) -> Option<usize> {
        self.cell_lines.get(index).copied()
    }

    /// Label used in errors and log messages.
    pub(crate) fn source_label(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<string>".to_string())
    }

    /// Outputs of a code cell as stored on the notebook.
    pub(crate) fn cell_outputs(&self, index: usize) -> Result<(Option<u32>, &[Output])> {
        let count = self.notebook.cells.len();
        let cell = self
            .notebook
            .cells
            .get(index)
            .ok_or(Error::CellIndex { index, count })?;
        Ok((cell.execution_count, &cell.outputs))
    }

    /// Record a finished execution and report it.
    ///
    /// Failures are logged as `exec` warnings naming the traceback report;
    /// with `raise_on_error` they are also returned as `Error::Execution`.
    pub(crate) fn conclude(&mut self, result: ExecutionResult) -> Result<()> {
        let ctx = LogContext::subtype("exec");
        let outcome = if result.succeeded {
            self.logger.info(
                &format!(
                    "Executed notebook in {:.2} seconds",
                    result.runtime.unwrap_or_default()
                ),
                &ctx,
            );
            Ok(())
        } else {
            let error = result.error.clone().unwrap_or_default();
            let traceback = result.traceback.clone().unwrap_or_default();
            let mut message = format!("Executing notebook failed: {error}");
            if let Some(path) = self.write_report(&traceback) {
                message.push_str(&format!("; traceback saved in: {}", path.display()));
            }
            if self.config.show_tb {
                message.push('\n');
                message.push_str(&traceback);
            }
            self.logger.warning(&message, &ctx);
            if self.config.raise_on_error {
                Err(Error::Execution {
                    notebook: self.source_label(),
                    error,
                    traceback,
                })
            } else {
                Ok(())
            }
        };
        self.exec_metadata = Some(result);
        outcome
    }
}

/// Capabilities of an execution client.
///
/// Clients are driven by [`ExecutionSession`], which calls `start` once,
/// then any number of accessors, then `finalise` and `close` exactly once.
pub trait ExecutionClient: Send {
    fn kind(&self) -> ClientKind;

    fn base(&self) -> &ClientBase;

    fn base_mut(&mut self) -> &mut ClientBase;

    /// Prepare outputs; executing clients run or restore the notebook here.
    fn start(&mut self) -> Result<()>;

    /// Whether outputs are produced per cell on demand.
    fn executes_lazily(&self) -> bool {
        false
    }

    /// Last step before `close` on the success path.
    fn finalise(&mut self) {}

    /// Release the kernel and temporary resources. Must not fail.
    fn close(&mut self) {}

    /// Execution count and outputs of cell `index`.
    fn code_cell_outputs(&mut self, index: usize) -> Result<(Option<u32>, &[Output])> {
        self.base().cell_outputs(index)
    }

    /// Evaluate a variable in the live kernel.
    fn eval_variable(&mut self, _name: &str) -> Result<Vec<Output>> {
        Err(Error::Unsupported(
            "eval_variable requires execution_mode 'inline'".to_string(),
        ))
    }

    fn glue_data(&self) -> &GlueData {
        &self.base().glue_data
    }

    fn nb_metadata(&self) -> &Metadata {
        &self.base().notebook.metadata
    }

    fn exec_metadata(&self) -> Option<&ExecutionResult> {
        self.base().exec_metadata.as_ref()
    }

    fn cell_line(&self, index: usize) -> Option<usize> {
        self.base().cell_line(index)
    }

    fn source_code_lexer(&self) -> Option<String> {
        self.base().notebook.source_code_lexer()
    }
}
