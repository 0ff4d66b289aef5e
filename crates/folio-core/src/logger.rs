//! Document-facing logging.
//!
//! Execution clients report warnings about a specific document (cell errors,
//! duplicate glue keys, cache problems) through an injected [`NbLogger`]. Each
//! message can carry a source line and a subtype; the subtype is rendered as a
//! `[folio.<subtype>]` suffix so hosts can suppress whole categories.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

/// Severity of a document log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Location and category of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    /// Source line in the originating document.
    pub line: Option<usize>,

    /// Category, e.g. `exec`, `cache`, `glue`.
    pub subtype: Option<String>,
}

impl LogContext {
    /// Context with only a subtype.
    pub fn subtype(subtype: &str) -> Self {
        Self {
            line: None,
            subtype: Some(subtype.to_string()),
        }
    }

    /// Attach a source line.
    pub fn at_line(mut self, line: Option<usize>) -> Self {
        self.line = line;
        self
    }
}

/// Append the `[folio.<subtype>]` suffix.
pub fn format_message(message: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{message} [folio.{subtype}]"),
        None => message.to_string(),
    }
}

/// Logger injected into execution clients.
pub trait NbLogger: Send + Sync {
    /// Emit a message.
    fn log(&self, level: LogLevel, message: &str, ctx: &LogContext);

    fn debug(&self, message: &str, ctx: &LogContext) {
        self.log(LogLevel::Debug, message, ctx);
    }

    fn info(&self, message: &str, ctx: &LogContext) {
        self.log(LogLevel::Info, message, ctx);
    }

    fn warning(&self, message: &str, ctx: &LogContext) {
        self.log(LogLevel::Warning, message, ctx);
    }

    fn error(&self, message: &str, ctx: &LogContext) {
        self.log(LogLevel::Error, message, ctx);
    }
}

/// Shared handle to a logger.
pub type SharedLogger = Arc<dyn NbLogger>;

/// Forwards document messages to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    docname: String,
    suppressed: FxHashSet<String>,
}

impl TracingLogger {
    /// Logger for one document.
    pub fn new(docname: impl Into<String>) -> Self {
        Self {
            docname: docname.into(),
            suppressed: FxHashSet::default(),
        }
    }

    /// Suppress warnings of the given types (`folio` or `folio.<subtype>`).
    pub fn with_suppressed<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suppressed.extend(types.into_iter().map(Into::into));
        self
    }

    fn is_suppressed(&self, subtype: Option<&str>) -> bool {
        if self.suppressed.contains("folio") {
            return true;
        }
        subtype.is_some_and(|s| self.suppressed.contains(&format!("folio.{s}")))
    }
}

impl NbLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, ctx: &LogContext) {
        let subtype = ctx.subtype.as_deref();
        if level == LogLevel::Warning && self.is_suppressed(subtype) {
            return;
        }
        let message = format_message(message, subtype);
        let line = ctx.line.map(|l| l as u64);
        let docname = self.docname.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(docname, line, "{}", message),
            LogLevel::Info => tracing::info!(docname, line, "{}", message),
            LogLevel::Warning => tracing::warn!(docname, line, "{}", message),
            LogLevel::Error => tracing::error!(docname, line, "{}", message),
        }
    }
}

/// A message captured by [`RecordingLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub line: Option<usize>,
    pub subtype: Option<String>,
}

impl LogRecord {
    /// Message with its subtype suffix.
    pub fn formatted(&self) -> String {
        format_message(&self.message, self.subtype.as_deref())
    }
}

/// Collects messages in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured records.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Captured warnings.
    pub fn warnings(&self) -> Vec<LogRecord> {
        self.at_level(LogLevel::Warning)
    }

    /// Captured records of one level.
    pub fn at_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }

    /// Whether any captured message contains `text`.
    pub fn contains(&self, text: &str) -> bool {
        self.records().iter().any(|r| r.message.contains(text))
    }
}

impl NbLogger for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str, ctx: &LogContext) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                level,
                message: message.to_string(),
                line: ctx.line,
                subtype: ctx.subtype.clone(),
            });
        }
    }
}

impl<L: NbLogger + ?Sized> NbLogger for Arc<L> {
    fn log(&self, level: LogLevel, message: &str, ctx: &LogContext) {
        (**self).log(level, message, ctx);
    }
}
