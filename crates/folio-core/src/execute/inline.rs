//! Lazy cell-by-cell execution.
//!
//! The kernel is started when the client starts and kept alive while the
//! document renders. Requesting the outputs of cell `i` executes every cell
//! up to `i` that has not run yet, in document order. After an unrecoverable
//! cell error no further cells are executed, and later code cells are
//! returned empty. Cells tagged `skip-execution` keep their stored outputs.

use std::time::Instant;

use super::runner::{CellFailure, CellOutcome, CellRunner};
use super::workdir::WorkDir;
use super::{ClientBase, ClientKind, ExecutionClient, ExecutionResult};
use crate::config::ExecutionMode;
use crate::error::{Error, Result};
use crate::kernel::SharedLauncher;
use crate::logger::LogContext;
use crate::notebook::{Output, TAG_SKIP_EXECUTION, coalesce_streams, extract_glue_data_cell};

/// Executes cells on demand against a live kernel.
pub struct InlineClient {
    base: ClientBase,
    launcher: SharedLauncher,
    runner: Option<CellRunner>,
    workdir: Option<WorkDir>,
    started: Option<Instant>,
    /// Index of the last cell executed or passed over.
    last: Option<usize>,
    failure: Option<CellFailure>,
    closed: bool,
}

impl InlineClient {
    pub(crate) fn new(base: ClientBase, launcher: SharedLauncher) -> Self {
        Self {
            base,
            launcher,
            runner: None,
            workdir: None,
            started: None,
            last: None,
            failure: None,
            closed: false,
        }
    }

    /// The error that stopped execution, if any.
    pub fn failure(&self) -> Option<&CellFailure> {
        self.failure.as_ref()
    }

    /// Index of the last cell reached.
    pub fn last_executed(&self) -> Option<usize> {
        self.last
    }

    /// Remember a failure; with `raise_on_error` it is also returned.
    fn fail(&mut self, failure: CellFailure) -> Result<()> {
        let error = if self.base.config.raise_on_error {
            Err(Error::Execution {
                notebook: self.base.source_label(),
                error: failure.ename.clone(),
                traceback: failure.traceback.clone(),
            })
        } else {
            Ok(())
        };
        self.failure = Some(failure);
        error
    }

    /// Execute all cells up to and including `index`.
    fn advance_to(&mut self, index: usize) -> Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        let Some(runner) = self.runner.as_mut() else {
            return Ok(());
        };

        let from = self.last.map_or(0, |last| last + 1);
        for i in from..=index {
            self.last = Some(i);
            let outcome = runner.run_cell(&mut self.base.notebook.cells[i], i);
            if outcome != CellOutcome::Skipped {
                process_cell(&mut self.base, i);
            }
            if let CellOutcome::Failed(failure) = outcome {
                return self.fail(failure);
            }
        }
        Ok(())
    }
}

/// Glue extraction and stream coalescing for a freshly executed cell.
fn process_cell(base: &mut ClientBase, index: usize) {
    let line = base.cell_line(index);
    let cell = &mut base.notebook.cells[index];
    for (key, output) in extract_glue_data_cell(cell) {
        if base.glue_data.contains_key(&key) {
            base.logger.warning(
                &format!("glue key {:?} duplicate", key),
                &LogContext::subtype("glue").at_line(line),
            );
        }
        base.glue_data.insert(key, output);
    }
    if base.config.merge_streams {
        cell.outputs = coalesce_streams(std::mem::take(&mut cell.outputs));
    }
}

impl ExecutionClient for InlineClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Inline
    }

    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ClientBase {
        &mut self.base
    }

    fn executes_lazily(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<()> {
        let workdir = WorkDir::for_source(&self.base.config, self.base.path.as_deref())?;
        self.base.logger.info(
            "Starting inline execution client",
            &LogContext::subtype("exec"),
        );
        self.started = Some(Instant::now());

        let launched = CellRunner::launch(
            self.launcher.as_ref(),
            &self.base.notebook,
            &self.base.config,
            workdir.path(),
        );
        self.workdir = Some(workdir);

        match launched {
            Ok(mut runner) => match runner.handshake(&mut self.base.notebook, self.base.logger.as_ref()) {
                Ok(()) => {
                    self.runner = Some(runner);
                    Ok(())
                }
                Err(e) => {
                    runner.shutdown(self.base.logger.as_ref());
                    self.fail(CellFailure::from_error(None, None, &e))
                }
            },
            Err(e) => self.fail(CellFailure::from_error(None, None, &e)),
        }
    }

    fn code_cell_outputs(&mut self, index: usize) -> Result<(Option<u32>, &[Output])> {
        let count = self.base.notebook.cells.len();
        if index >= count {
            return Err(Error::CellIndex { index, count });
        }
        self.advance_to(index)?;
        // Withhold stale outputs of cells that will not run after a failure.
        if self.failure.is_some() && self.last.is_none_or(|last| index > last) {
            let cell = &mut self.base.notebook.cells[index];
            if cell.is_code() && !cell.has_tag(TAG_SKIP_EXECUTION) {
                cell.clear_outputs();
            }
        }
        self.base.cell_outputs(index)
    }

    /// Evaluate `name` in the current kernel state.
    ///
    /// Cells are not advanced, so a name defined by a cell that has not been
    /// reached yet fails with the kernel's `NameError`.
    fn eval_variable(&mut self, name: &str) -> Result<Vec<Output>> {
        if !self.base.config.is_valid_eval_name(name)? {
            return Err(Error::EvalName(name.to_string()));
        }
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| Error::Kernel("inline kernel is not running".to_string()))?;

        let reply = runner.evaluate(name)?;
        match reply.error {
            Some(error) => Err(Error::EvalFailed {
                name: name.to_string(),
                ename: error.ename,
                evalue: error.evalue,
            }),
            None => Ok(reply.outputs),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(started) = self.started else {
            return;
        };
        self.base.logger.info(
            "Stopping inline execution client",
            &LogContext::subtype("exec"),
        );
        if let Some(runner) = self.runner.take() {
            runner.write_widget_state(&mut self.base.notebook);
            runner.shutdown(self.base.logger.as_ref());
        }
        self.workdir = None;

        let runtime = Some(started.elapsed().as_secs_f64());
        let result = match self.failure.clone() {
            None => ExecutionResult::success(ExecutionMode::Inline, runtime),
            Some(failure) => ExecutionResult::failure(
                ExecutionMode::Inline,
                runtime,
                failure.ename,
                failure.traceback,
            ),
        };
        // A raised failure was already returned to the caller.
        if let Err(e) = self.base.conclude(result) {
            tracing::debug!("Inline execution concluded with error: {}", e);
        }
    }
}
