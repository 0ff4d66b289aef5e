//! Scoped use of an execution client.

use super::{ClientKind, ExecutionClient, ExecutionResult};
use crate::error::Result;
use crate::notebook::{
    GlueData, Metadata, NotebookDocument, Output, coalesce_streams, extract_glue_data,
};

/// What a finished session hands back to the host.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The notebook with its outputs.
    pub notebook: NotebookDocument,

    /// `None` when nothing was executed.
    pub exec_metadata: Option<ExecutionResult>,

    pub glue_data: GlueData,
}

/// An opened client.
///
/// The client is started on open and closed exactly once, either by
/// [`finish`](Self::finish) or when the session is dropped.
pub struct ExecutionSession {
    client: Box<dyn ExecutionClient>,
    closed: bool,
}

impl ExecutionSession {
    /// Start `client`; it is closed again if starting fails.
    pub fn open(mut client: Box<dyn ExecutionClient>) -> Result<Self> {
        if let Err(e) = client.start() {
            client.close();
            return Err(e);
        }

        if !client.executes_lazily() {
            let base = client.base_mut();
            base.glue_data =
                extract_glue_data(&mut base.notebook, &base.cell_lines, base.logger.as_ref());
            if base.config.merge_streams {
                for cell in base.notebook.cells.iter_mut().filter(|c| c.is_code()) {
                    cell.outputs = coalesce_streams(std::mem::take(&mut cell.outputs));
                }
            }
        }

        Ok(Self {
            client,
            closed: false,
        })
    }

    pub fn kind(&self) -> ClientKind {
        self.client.kind()
    }

    /// Execution count and outputs of cell `index`.
    pub fn code_cell_outputs(&mut self, index: usize) -> Result<(Option<u32>, &[Output])> {
        self.client.code_cell_outputs(index)
    }

    pub fn eval_variable(&mut self, name: &str) -> Result<Vec<Output>> {
        self.client.eval_variable(name)
    }

    pub fn glue_data(&self) -> &GlueData {
        self.client.glue_data()
    }

    pub fn cell_line(&self, index: usize) -> Option<usize> {
        self.client.cell_line(index)
    }

    pub fn nb_metadata(&self) -> &Metadata {
        self.client.nb_metadata()
    }

    pub fn exec_metadata(&self) -> Option<&ExecutionResult> {
        self.client.exec_metadata()
    }

    pub fn source_code_lexer(&self) -> Option<String> {
        self.client.source_code_lexer()
    }

    pub fn notebook(&self) -> &NotebookDocument {
        self.client.base().notebook()
    }

    /// Finalise and close the client.
    pub fn finish(mut self) -> ExecutionOutcome {
        self.client.finalise();
        self.close();
        let base = self.client.base_mut();
        ExecutionOutcome {
            notebook: std::mem::take(&mut base.notebook),
            exec_metadata: base.exec_metadata.take(),
            glue_data: std::mem::take(&mut base.glue_data),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.client.close();
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        self.close();
    }
}
