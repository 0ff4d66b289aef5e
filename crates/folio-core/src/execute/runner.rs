//! Cell-by-cell execution against a live kernel.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::kernel::{
    ExecuteOptions, ExecuteReply, Kernel, KernelError, KernelLauncher, STARTUP_TIMEOUT,
    WIDGET_STATE_MIMETYPE,
};
use crate::logger::{LogContext, NbLogger};
use crate::notebook::{Cell, NotebookDocument, Output, TAG_RAISES_EXCEPTION, TAG_SKIP_EXECUTION};

/// Why a notebook run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    /// Index of the failing cell; `None` when the kernel could not start.
    pub cell_index: Option<usize>,

    /// Error kind name, e.g. `ZeroDivisionError` or `CellTimeoutError`.
    pub ename: String,

    /// Human readable traceback.
    pub traceback: String,

    /// The kernel could not be started or reached, so the notebook's code is
    /// not at fault. Such failures are never stored for replay.
    pub environmental: bool,
}

impl CellFailure {
    fn from_kernel_error(index: usize, source: &str, error: &KernelError) -> Self {
        Self {
            cell_index: Some(index),
            ename: error.ename.clone(),
            traceback: cell_traceback(source, &error.traceback_text()),
            environmental: false,
        }
    }

    pub(crate) fn from_error(index: Option<usize>, source: Option<&str>, error: &Error) -> Self {
        let message = error.to_string();
        Self {
            cell_index: index,
            ename: error.kind_name().to_string(),
            traceback: match source {
                Some(source) => cell_traceback(source, &message),
                None => message,
            },
            // Only a cell running past its timeout is the code's doing.
            environmental: index.is_none() || !matches!(error, Error::KernelTimeout { .. }),
        }
    }
}

fn cell_traceback(source: &str, traceback: &str) -> String {
    format!(
        "An error occurred while executing the following cell:\n------------------\n{}\n------------------\n\n{}\n",
        source, traceback
    )
}

/// Result of running one cell.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CellOutcome {
    Completed,
    Skipped,
    Failed(CellFailure),
}

/// Runs notebook cells on one kernel.
pub(crate) struct CellRunner {
    kernel: Box<dyn Kernel>,
    timeout: Option<Duration>,
    allow_errors: bool,
    executed: u32,
}

impl CellRunner {
    /// Launch the notebook's kernel in `cwd`.
    pub fn launch(
        launcher: &dyn KernelLauncher,
        notebook: &NotebookDocument,
        config: &ExecutionConfig,
        cwd: &Path,
    ) -> Result<Self> {
        let requested = notebook.kernel_name();
        let name = config.resolve_kernel_name(&requested);
        if name != requested {
            tracing::debug!("Replaced kernel name: {:?} -> {:?}", requested, name);
        }
        tracing::debug!("Launching kernel {:?} in {}", name, cwd.display());
        let kernel = launcher.launch(&name, cwd)?;
        Ok(Self {
            kernel,
            timeout: config.timeout_duration(),
            allow_errors: config.allow_errors,
            executed: 0,
        })
    }

    /// Kernel-info handshake; stores `language_info` on the notebook.
    pub fn handshake(&mut self, notebook: &mut NotebookDocument, logger: &dyn NbLogger) -> Result<()> {
        let info = self.kernel.kernel_info(Some(STARTUP_TIMEOUT))?;
        match info.language_info {
            Some(language_info) => {
                notebook
                    .metadata
                    .insert("language_info".to_string(), Value::Object(language_info));
            }
            None => logger.warning(
                "Failed to retrieve language info from kernel",
                &LogContext::subtype("exec"),
            ),
        }
        Ok(())
    }

    /// Execute one cell in place.
    ///
    /// Errors raised by the code are failures unless `allow_errors` is set or
    /// the cell is tagged `raises-exception`. Timeouts and kernel deaths are
    /// always failures.
    pub fn run_cell(&mut self, cell: &mut Cell, index: usize) -> CellOutcome {
        if !cell.is_code() || cell.has_tag(TAG_SKIP_EXECUTION) {
            return CellOutcome::Skipped;
        }
        cell.clear_outputs();
        if cell.source.trim().is_empty() {
            return CellOutcome::Skipped;
        }

        match self.kernel.execute(&cell.source, ExecuteOptions::default(), self.timeout) {
            Ok(reply) => {
                self.executed += 1;
                cell.execution_count = reply.execution_count.or(Some(self.executed));
                cell.outputs = reply.outputs;
                match reply.error {
                    Some(error) if !self.allow_errors && !cell.has_tag(TAG_RAISES_EXCEPTION) => {
                        CellOutcome::Failed(CellFailure::from_kernel_error(index, &cell.source, &error))
                    }
                    _ => CellOutcome::Completed,
                }
            }
            Err(error) => {
                tracing::warn!("Cell {} did not complete: {}", index, error);
                cell.outputs.push(Output::Error {
                    ename: error.kind_name().to_string(),
                    evalue: error.to_string(),
                    traceback: Vec::new(),
                });
                CellOutcome::Failed(CellFailure::from_error(Some(index), Some(&cell.source), &error))
            }
        }
    }

    /// Execute every cell in order, stopping at the first failure.
    pub fn run_notebook(&mut self, notebook: &mut NotebookDocument) -> Option<CellFailure> {
        for (index, cell) in notebook.cells.iter_mut().enumerate() {
            if let CellOutcome::Failed(failure) = self.run_cell(cell, index) {
                return Some(failure);
            }
        }
        None
    }

    /// Evaluate an expression without touching the execution count.
    pub fn evaluate(&mut self, expression: &str) -> Result<ExecuteReply> {
        self.kernel
            .execute(expression, ExecuteOptions::evaluation(), self.timeout)
    }

    /// Store collected widget state in `metadata.widgets`.
    pub fn write_widget_state(&self, notebook: &mut NotebookDocument) {
        if let Some(state) = self.kernel.widget_state() {
            notebook
                .metadata
                .insert("widgets".to_string(), json!({ WIDGET_STATE_MIMETYPE: state }));
        }
    }

    /// Shut the kernel down, logging failures.
    pub fn shutdown(mut self, logger: &dyn NbLogger) {
        if let Err(e) = self.kernel.shutdown() {
            logger.warning(
                &format!("Failed to shut down kernel: {e}"),
                &LogContext::subtype("exec"),
            );
        }
    }
}

/// Execute a whole notebook on a fresh kernel.
///
/// Outputs are replaced cell by cell as cells run; cells that are skipped or
/// never reached keep what they had. Returns the runtime in seconds and the
/// failure that stopped execution.
pub(crate) fn execute_notebook(
    launcher: &dyn KernelLauncher,
    notebook: &mut NotebookDocument,
    config: &ExecutionConfig,
    cwd: &Path,
    logger: &dyn NbLogger,
) -> (f64, Option<CellFailure>) {
    let started = Instant::now();

    let mut runner = match CellRunner::launch(launcher, notebook, config, cwd) {
        Ok(runner) => runner,
        Err(e) => {
            return (
                started.elapsed().as_secs_f64(),
                Some(CellFailure::from_error(None, None, &e)),
            );
        }
    };

    let failure = match runner.handshake(notebook, logger) {
        Ok(()) => runner.run_notebook(notebook),
        Err(e) => Some(CellFailure::from_error(None, None, &e)),
    };
    runner.write_widget_state(notebook);
    runner.shutdown(logger);

    (started.elapsed().as_secs_f64(), failure)
}
