//! Client that never executes.

use super::{ClientBase, ClientKind, ExecutionClient};
use crate::error::Result;

/// Serves the outputs stored in the notebook as they are.
pub struct ReadOnlyClient {
    base: ClientBase,
}

impl ReadOnlyClient {
    pub(crate) fn new(base: ClientBase) -> Self {
        Self { base }
    }
}

impl ExecutionClient for ReadOnlyClient {
    fn kind(&self) -> ClientKind {
        ClientKind::ReadOnly
    }

    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ClientBase {
        &mut self.base
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }
}
