//! Error types for folio-core.

use thiserror::Error;

/// Result type for folio-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in folio-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid mode/timeout/path combination, raised before any execution.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cell failed and the configuration demands a hard failure.
    #[error("executing notebook {notebook} failed: {error}")]
    Execution {
        /// Path or description of the notebook source.
        notebook: String,
        /// Name of the underlying failure (e.g. `ZeroDivisionError`).
        error: String,
        /// Full traceback of the failure.
        traceback: String,
    },

    /// Cell index out of range.
    #[error("cell index {index} out of range (notebook has {count} cells)")]
    CellIndex { index: usize, count: usize },

    /// Invalid name passed to `eval_variable`.
    #[error("invalid evaluation name: {0:?}")]
    EvalName(String),

    /// The kernel could not evaluate an expression.
    #[error("failed to evaluate {name:?}: {ename}: {evalue}")]
    EvalFailed {
        name: String,
        ename: String,
        evalue: String,
    },

    /// The client does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Cache lookup or merge produced inconsistent data.
    #[error("cache consistency error for {key}: {message}")]
    CacheConsistency { key: String, message: String },

    /// Cache storage error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Kernel communication error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// A kernel request did not complete in time.
    #[error("kernel request timed out after {seconds} seconds")]
    KernelTimeout { seconds: u64 },

    /// The kernel process exited unexpectedly.
    #[error("kernel died: {0}")]
    KernelDied(String),

    /// Kernel specification not found or invalid.
    #[error("kernel spec error: {0}")]
    KernelSpec(String),

    /// Notebook structure is invalid.
    #[error("invalid notebook: {0}")]
    Notebook(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Format the error with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    /// Recovery hint for the error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Configuration(_) => {
                Some("check the execution settings, or enable execution_in_temp for sources without a file")
            }
            Error::CacheConsistency { .. } | Error::Cache(_) => {
                Some("re-run the build; if the problem persists clear the cache with `folio cache clear`")
            }
            Error::KernelSpec(_) => {
                Some("install a kernel spec (kernel.json) or set FOLIO_KERNEL_PATH")
            }
            Error::KernelTimeout { .. } => Some("increase execution_timeout"),
            _ => None,
        }
    }

    /// Short kind name, as reported in execution results.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::Execution { .. } => "ExecutionError",
            Error::CellIndex { .. } => "IndexError",
            Error::EvalName(_) => "EvalNameError",
            Error::EvalFailed { .. } => "EvalError",
            Error::Unsupported(_) => "NotImplementedError",
            Error::CacheConsistency { .. } => "CacheConsistencyError",
            Error::Cache(_) => "CacheError",
            Error::Kernel(_) => "KernelError",
            Error::KernelTimeout { .. } => "CellTimeoutError",
            Error::KernelDied(_) => "DeadKernelError",
            Error::KernelSpec(_) => "NoSuchKernel",
            Error::Notebook(_) => "NotebookError",
            Error::Serialization(_) | Error::Deserialization(_) | Error::Json(_) => {
                "SerializationError"
            }
            Error::Io(_) => "IOError",
        }
    }
}
