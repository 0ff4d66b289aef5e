//! Shared helpers for folio-core integration tests.
//!
//! [`FakeKernelLauncher`] starts in-process kernels that interpret a tiny
//! language, one statement per line:
//!
//! - `name = expr` assigns a variable
//! - `print(expr)` writes to stdout
//! - `display(key, expr)` emits a glued display output
//! - `sleep(n)` times out when `n` exceeds the request timeout
//! - `crash()` kills the kernel
//! - a bare `expr` on the last line becomes the execute result
//!
//! Expressions are integers, quoted strings, names and `a/b`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tempfile::TempDir;

use folio_core::{
    Cell, Error, ExecuteOptions, ExecuteReply, Kernel, KernelError, KernelInfo, KernelLauncher,
    NotebookDocument, Output, Result,
};

// =============================================================================
// Fake kernel
// =============================================================================

#[derive(Debug, Default)]
struct LauncherState {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    shutdown_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    cwds: Mutex<Vec<PathBuf>>,
    kernel_names: Mutex<Vec<String>>,
}

/// Launcher of scripted kernels that records what happened.
#[derive(Debug, Clone, Default)]
pub struct FakeKernelLauncher {
    state: Arc<LauncherState>,
    fail_launch: bool,
    fail_shutdown: bool,
}

impl FakeKernelLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launcher whose kernels never start.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    /// Launcher whose kernels report an error on shutdown.
    pub fn failing_shutdown() -> Self {
        Self {
            fail_shutdown: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Every call to `shutdown`, including repeated ones.
    pub fn shutdown_calls(&self) -> usize {
        self.state.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Code of every execute request, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().unwrap().clone()
    }

    pub fn cwds(&self) -> Vec<PathBuf> {
        self.state.cwds.lock().unwrap().clone()
    }

    pub fn kernel_names(&self) -> Vec<String> {
        self.state.kernel_names.lock().unwrap().clone()
    }
}

impl KernelLauncher for FakeKernelLauncher {
    fn launch(&self, kernel_name: &str, cwd: &Path) -> Result<Box<dyn Kernel>> {
        self.state
            .kernel_names
            .lock()
            .unwrap()
            .push(kernel_name.to_string());
        if self.fail_launch {
            return Err(Error::KernelSpec(format!("no such kernel: {kernel_name}")));
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        self.state.cwds.lock().unwrap().push(cwd.to_path_buf());
        Ok(Box::new(FakeKernel {
            state: self.state.clone(),
            vars: HashMap::new(),
            count: 0,
            shut_down: false,
            fail_shutdown: self.fail_shutdown,
        }))
    }
}

#[derive(Debug, Clone)]
enum Val {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Val {
    fn repr(&self) -> String {
        match self {
            Val::Int(n) => n.to_string(),
            Val::Float(f) => format!("{f:?}"),
            Val::Str(s) => format!("'{s}'"),
        }
    }

    fn print(&self) -> String {
        match self {
            Val::Str(s) => s.clone(),
            other => other.repr(),
        }
    }
}

struct FakeKernel {
    state: Arc<LauncherState>,
    vars: HashMap<String, Val>,
    count: u32,
    shut_down: bool,
    fail_shutdown: bool,
}

fn raise(ename: &str, evalue: impl Into<String>) -> KernelError {
    let evalue = evalue.into();
    KernelError {
        ename: ename.to_string(),
        traceback: vec!["Traceback (most recent call last):".to_string(), format!("{ename}: {evalue}")],
        evalue,
    }
}

impl FakeKernel {
    fn eval(&self, expr: &str) -> std::result::Result<Val, KernelError> {
        let expr = expr.trim();
        if let Some((a, b)) = expr.split_once('/') {
            let a = self.eval(a)?;
            let b = self.eval(b)?;
            return match (a, b) {
                (_, Val::Int(0)) => Err(raise("ZeroDivisionError", "division by zero")),
                (Val::Int(a), Val::Int(b)) if a % b == 0 => Ok(Val::Int(a / b)),
                (Val::Int(a), Val::Int(b)) => Ok(Val::Float(a as f64 / b as f64)),
                _ => Err(raise("TypeError", "unsupported operand type(s) for /")),
            };
        }
        if let Some(s) = expr.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return Ok(Val::Str(s.to_string()));
        }
        if let Ok(n) = expr.parse::<i64>() {
            return Ok(Val::Int(n));
        }
        self.vars
            .get(expr)
            .cloned()
            .ok_or_else(|| raise("NameError", format!("name '{expr}' is not defined")))
    }

    fn run_line(
        &mut self,
        line: &str,
        is_last: bool,
        timeout: Option<Duration>,
        outputs: &mut Vec<Output>,
    ) -> Result<std::result::Result<(), KernelError>> {
        let line = line.trim();
        if let Some(arg) = call_arg(line, "sleep") {
            let seconds: u64 = arg.trim().parse().unwrap_or(0);
            if let Some(timeout) = timeout
                && Duration::from_secs(seconds) > timeout
            {
                return Err(Error::KernelTimeout {
                    seconds: timeout.as_secs(),
                });
            }
            return Ok(Ok(()));
        }
        if call_arg(line, "crash").is_some() {
            self.shut_down = true;
            return Err(Error::KernelDied("kernel process exited".to_string()));
        }
        if let Some(arg) = call_arg(line, "print") {
            return Ok(self.eval(arg).map(|value| {
                outputs.push(Output::stdout(format!("{}\n", value.print())));
            }));
        }
        if let Some(arg) = call_arg(line, "display") {
            let (key, expr) = arg.split_once(',').unwrap_or((arg, arg));
            let key = key.trim().trim_matches('"').to_string();
            return Ok(self.eval(expr).map(|value| {
                outputs.push(glue_output(&key, &value.repr()));
            }));
        }
        if let Some((name, expr)) = line.split_once('=') {
            let name = name.trim().to_string();
            return Ok(self.eval(expr).map(|value| {
                self.vars.insert(name, value);
            }));
        }
        let value = match self.eval(line) {
            Ok(value) => value,
            Err(e) => return Ok(Err(e)),
        };
        if is_last {
            outputs.push(Output::text_result(Some(self.count), value.repr()));
        }
        Ok(Ok(()))
    }
}

fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// Display output glued under `key`.
pub fn glue_output(key: &str, text: &str) -> Output {
    let mut data = Map::new();
    data.insert("text/plain".to_string(), Value::String(text.to_string()));
    let mut metadata = Map::new();
    metadata.insert("scrapbook".to_string(), json!({"name": key, "mime_prefix": ""}));
    Output::DisplayData { data, metadata }
}

impl Kernel for FakeKernel {
    fn kernel_info(&mut self, _timeout: Option<Duration>) -> Result<KernelInfo> {
        let mut language_info = Map::new();
        language_info.insert("name".to_string(), json!("python"));
        language_info.insert("pygments_lexer".to_string(), json!("ipython3"));
        Ok(KernelInfo {
            language_info: Some(language_info),
            implementation: Some("fake".to_string()),
        })
    }

    fn execute(
        &mut self,
        code: &str,
        options: ExecuteOptions,
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        if self.shut_down {
            return Err(Error::KernelDied("kernel was shut down".to_string()));
        }
        self.state.executed.lock().unwrap().push(code.to_string());
        if options.store_history {
            self.count += 1;
        }

        let lines: Vec<&str> = code.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut outputs = Vec::new();
        let mut error = None;
        for (i, line) in lines.iter().enumerate() {
            if let Err(e) = self.run_line(line, i + 1 == lines.len(), timeout, &mut outputs)? {
                outputs.push(e.to_output());
                error = Some(e);
                break;
            }
        }
        Ok(ExecuteReply {
            execution_count: Some(self.count),
            outputs,
            error,
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        self.state.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if !self.shut_down {
            self.shut_down = true;
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_shutdown {
            return Err(Error::Kernel("shutdown_request was not acknowledged".to_string()));
        }
        Ok(())
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown();
        }
    }
}

// =============================================================================
// Notebook fixtures
// =============================================================================

/// Notebook with one code cell per source.
pub fn notebook(sources: &[&str]) -> NotebookDocument {
    NotebookDocument::with_cells(sources.iter().map(|s| Cell::code(*s)).collect())
}

/// RAII wrapper for a notebook file in a scratch directory.
pub struct TestNotebook {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestNotebook {
    /// Write `notebook` as `name` in a fresh directory.
    pub fn new(name: &str, notebook: &NotebookDocument) -> Self {
        let dir = TempDir::new().expect("Failed to create test directory");
        let path = dir.path().join(name);
        folio_core::write_notebook(notebook, &path).expect("Failed to write notebook");
        Self { dir, path }
    }

    /// Source identifier passed to the orchestrator.
    pub fn source(&self) -> &str {
        self.path.to_str().expect("non UTF-8 temp path")
    }

    pub fn read(&self) -> NotebookDocument {
        folio_core::read_notebook(&self.path).expect("Failed to read notebook")
    }

    /// Directory holding the notebook file.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join(".folio_cache")
    }

    pub fn rewrite(&self, notebook: &NotebookDocument) {
        fs::remove_file(&self.path).expect("Failed to remove notebook");
        folio_core::write_notebook(notebook, &self.path).expect("Failed to write notebook");
    }
}

/// Stdout text of a cell's outputs.
pub fn stdout_of(outputs: &[Output]) -> String {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Stream { name, text } if name == "stdout" => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
