//! Kernel communication.
//!
//! A [`Kernel`] executes code and reports the outputs it produced. Execution
//! clients obtain kernels from a [`KernelLauncher`], so the process-backed
//! implementation can be replaced in tests.
//!
//! Process kernels speak the Jupyter messaging protocol over ZeroMQ: a
//! connection file names the ports and HMAC key, requests go out on the shell
//! and control sockets, and outputs come back on iopub.

mod collect;
pub mod connection;
pub mod process;
pub mod protocol;
pub mod spec;
pub mod transport;
pub mod wire;

pub use collect::{OutputCollector, WIDGET_STATE_MIMETYPE, WidgetState};
pub use connection::ConnectionInfo;
pub use process::{ProcessKernel, ProcessKernelLauncher};
pub use spec::{KernelSpec, find_kernel_spec, kernel_search_paths, list_kernel_specs};
pub use transport::{Channel, Transport, ZmqTransport};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::notebook::{Metadata, Output};

/// Time allowed for a kernel to start and complete the handshake.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of the kernel-info handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelInfo {
    /// `language_info` mapping reported by the kernel.
    pub language_info: Option<Metadata>,

    /// Kernel implementation name.
    pub implementation: Option<String>,
}

/// Options of an execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Record the execution in history and increment the execution count.
    pub store_history: bool,

    /// Abort queued requests after an error.
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            store_history: true,
            stop_on_error: true,
        }
    }
}

impl ExecuteOptions {
    /// Options for evaluating an expression without touching history.
    pub fn evaluation() -> Self {
        Self {
            store_history: false,
            stop_on_error: false,
        }
    }
}

/// An error raised by executed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelError {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

impl KernelError {
    /// Traceback lines joined into one string.
    pub fn traceback_text(&self) -> String {
        if self.traceback.is_empty() {
            format!("{}: {}", self.ename, self.evalue)
        } else {
            self.traceback.join("\n")
        }
    }

    /// Error as a notebook output.
    pub fn to_output(&self) -> Output {
        Output::Error {
            ename: self.ename.clone(),
            evalue: self.evalue.clone(),
            traceback: self.traceback.clone(),
        }
    }
}

/// Outcome of an execute request that completed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteReply {
    /// Execution count assigned by the kernel.
    pub execution_count: Option<u32>,

    /// Outputs broadcast for the request, in order.
    pub outputs: Vec<Output>,

    /// Error raised by the code, if any.
    pub error: Option<KernelError>,
}

/// A live kernel.
pub trait Kernel: Send {
    /// Run the kernel-info handshake.
    fn kernel_info(&mut self, timeout: Option<Duration>) -> Result<KernelInfo>;

    /// Execute code and wait for its reply; `None` waits indefinitely.
    ///
    /// Returns `Error::KernelTimeout` when no reply arrives in time and
    /// `Error::KernelDied` when the kernel is gone.
    fn execute(
        &mut self,
        code: &str,
        options: ExecuteOptions,
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply>;

    /// Widget state accumulated from comm messages, in the
    /// `application/vnd.jupyter.widget-state+json` shape.
    fn widget_state(&self) -> Option<Value> {
        None
    }

    /// Shut the kernel down and release its resources.
    fn shutdown(&mut self) -> Result<()>;
}

/// Starts kernels.
pub trait KernelLauncher: Send + Sync {
    /// Start the named kernel with `cwd` as its working directory.
    fn launch(&self, kernel_name: &str, cwd: &Path) -> Result<Box<dyn Kernel>>;
}

/// Shared handle to a launcher.
pub type SharedLauncher = Arc<dyn KernelLauncher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceback_text() {
        let error = KernelError {
            ename: "ZeroDivisionError".to_string(),
            evalue: "division by zero".to_string(),
            traceback: Vec::new(),
        };
        assert_eq!(error.traceback_text(), "ZeroDivisionError: division by zero");

        let error = KernelError {
            traceback: vec!["line 1".to_string(), "line 2".to_string()],
            ..error
        };
        assert_eq!(error.traceback_text(), "line 1\nline 2");
        assert!(error.to_output().is_error());
    }
}
