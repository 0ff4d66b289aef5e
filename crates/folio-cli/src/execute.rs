//! Execute command implementation for folio CLI.
//!
//! Runs each notebook through the orchestrator, optionally writes the
//! executed notebooks, and prints an execution statistics table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use folio_core::{
    ExecutionConfig, ExecutionContext, ExecutionMode, ExecutionResult, TracingLogger,
    create_client, parse_timeout, read_notebook, write_notebook,
};

use crate::colors;
use crate::stats::{StatsRow, render_table};

/// Command line overrides of the configuration.
#[derive(Debug, Default)]
pub struct ExecuteArgs {
    pub mode: Option<ExecutionMode>,
    /// Seconds per cell; `-1` disables the timeout.
    pub timeout: Option<i64>,
    pub allow_errors: bool,
    pub in_temp: bool,
    pub cache_path: Option<PathBuf>,
    pub exclude: Vec<String>,
    pub raise_on_error: bool,
    pub show_tb: bool,
    pub merge_streams: bool,
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl ExecuteArgs {
    /// Configuration file (or defaults) with flags applied on top.
    fn config(&self) -> anyhow::Result<ExecutionConfig> {
        let mut config = match &self.config {
            Some(path) => ExecutionConfig::load(path)?,
            None => ExecutionConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = parse_timeout(timeout)?;
        }
        if let Some(path) = &self.cache_path {
            config.cache_path = Some(path.clone());
        }
        config.allow_errors |= self.allow_errors;
        config.in_temp |= self.in_temp;
        config.raise_on_error |= self.raise_on_error;
        config.show_tb |= self.show_tb;
        config.merge_streams |= self.merge_streams;
        config.exclude_patterns.extend(self.exclude.iter().cloned());
        config.validate()?;
        Ok(config)
    }
}

/// Execute notebooks.
pub fn execute(notebooks: &[PathBuf], args: &ExecuteArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = args.config()?;
    let build_root = std::env::current_dir()?;

    println!(
        "\n{}Executing{} {} notebook(s) in '{}' mode",
        colors::BOLD,
        colors::RESET,
        notebooks.len(),
        config.mode
    );
    println!("{}", "─".repeat(50));

    let mut rows = Vec::new();
    for path in notebooks {
        let result = execute_one(path, &config, &build_root, args.output_dir.as_deref())?;
        print_status(path, result.as_ref());
        if let Some(result) = result {
            rows.push(StatsRow {
                document: path.display().to_string(),
                result,
            });
        }
    }

    if !rows.is_empty() {
        println!("\n{}", render_table(&rows));
    }

    let failed = rows.iter().filter(|row| !row.result.succeeded).count();
    println!("{}", "─".repeat(50));
    if failed > 0 {
        println!(
            "{}Failed{} {} of {} notebook(s) in {:.2}s",
            colors::RED,
            colors::RESET,
            failed,
            notebooks.len(),
            start.elapsed().as_secs_f64()
        );
        anyhow::bail!("{} notebook(s) failed to execute", failed);
    }
    println!(
        "{}Completed{} {} notebook(s) in {:.2}s",
        colors::GREEN,
        colors::RESET,
        notebooks.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn execute_one(
    path: &Path,
    config: &ExecutionConfig,
    build_root: &Path,
    output_dir: Option<&Path>,
) -> anyhow::Result<Option<ExecutionResult>> {
    if !path.exists() {
        anyhow::bail!("Notebook not found: {}", path.display());
    }
    let notebook = read_notebook(path)?;
    let source = path.to_string_lossy();

    let logger = Arc::new(TracingLogger::new(source.as_ref()));
    let mut ctx = ExecutionContext::new(logger).with_build_root(build_root);
    if let Some(dir) = output_dir {
        ctx = ctx.with_reports_dir(dir.join("reports"));
    }
    let outcome = create_client(notebook, &source, config, &ctx)?.finish();

    if let Some(dir) = output_dir {
        let name = path.file_name().unwrap_or(path.as_os_str());
        let target = dir.join(name);
        write_notebook(&outcome.notebook, &target)?;
        tracing::debug!("Wrote executed notebook to {}", target.display());
    }
    Ok(outcome.exec_metadata)
}

fn print_status(path: &Path, result: Option<&ExecutionResult>) {
    match result {
        None => println!(
            "  {}-{} {} {}(not executed){}",
            colors::DIM,
            colors::RESET,
            path.display(),
            colors::DIM,
            colors::RESET
        ),
        Some(result) if result.succeeded => println!(
            "  {}✓{} {} ({}, {:.2}s)",
            colors::GREEN,
            colors::RESET,
            path.display(),
            result.method,
            result.runtime.unwrap_or_default()
        ),
        Some(result) => {
            println!(
                "  {}✗{} {}: {}",
                colors::RED,
                colors::RESET,
                path.display(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
