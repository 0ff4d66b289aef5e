//! Notebook execution and caching engine for folio.
//!
//! This crate provides:
//! - The notebook document model and nbformat IO
//! - Execution configuration with per-notebook overrides
//! - A content-addressed cache of executed notebooks
//! - Kernel discovery and the Jupyter messaging protocol over ZeroMQ
//! - Execution clients and the orchestrator that selects them

pub mod cache;
pub mod config;
pub mod error;
pub mod execute;
pub mod glob;
pub mod kernel;
pub mod logger;
pub mod notebook;
pub mod paths;

pub use cache::{
    CacheMatch, CacheRecord, CacheStore, DiskCacheStore, MemoryCacheStore, SharedCacheStore,
    StagedRecord, content_hash, execution_key, merge_match_into,
};
pub use config::{ExecutionConfig, ExecutionMode, parse_timeout};
pub use error::{Error, Result};
pub use execute::{
    CachedClient, ClientKind, DirectClient, ExecutionClient, ExecutionContext, ExecutionOutcome,
    ExecutionResult, ExecutionSession, InlineClient, ReadOnlyClient, create_client,
};
pub use kernel::{
    ExecuteOptions, ExecuteReply, Kernel, KernelError, KernelInfo, KernelLauncher, KernelSpec,
    ProcessKernelLauncher, SharedLauncher,
};
pub use logger::{
    LogContext, LogLevel, LogRecord, NbLogger, RecordingLogger, SharedLogger, TracingLogger,
};
pub use notebook::{
    Cell, CellType, GlueData, NotebookDocument, Output, read_notebook, read_notebook_str,
    write_notebook,
};
pub use paths::CacheDirs;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch.
pub(crate) fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
