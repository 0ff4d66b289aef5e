//! Whole-notebook execution at start.

use super::runner::execute_notebook;
use super::workdir::WorkDir;
use super::{ClientBase, ClientKind, ExecutionClient, ExecutionResult};
use crate::error::Result;
use crate::kernel::SharedLauncher;
use crate::logger::LogContext;

/// Executes the notebook on a fresh kernel when started.
pub struct DirectClient {
    base: ClientBase,
    launcher: SharedLauncher,
}

impl DirectClient {
    pub(crate) fn new(base: ClientBase, launcher: SharedLauncher) -> Self {
        Self { base, launcher }
    }
}

impl ExecutionClient for DirectClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Direct
    }

    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ClientBase {
        &mut self.base
    }

    fn start(&mut self) -> Result<()> {
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

        let method = base.config.mode;
        let result = match failure {
            None => ExecutionResult::success(method, Some(runtime)),
            Some(failure) => {
                ExecutionResult::failure(method, Some(runtime), failure.ename, failure.traceback)
            }
        };
        base.conclude(result)
    }
}
