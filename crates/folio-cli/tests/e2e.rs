//! End-to-end tests for folio CLI commands.
//!
//! These tests verify that the CLI produces expected output
//! when run against real notebook files. They never need an installed
//! kernel: notebooks either skip execution or name a kernel that does
//! not exist.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use folio_core::{CacheStore, DiskCacheStore};
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Create a temporary directory with a test notebook.
struct TestNotebook {
    temp_dir: TempDir,
    notebook_path: PathBuf,
}

impl TestNotebook {
    fn new(filename: &str, notebook: serde_json::Value) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let notebook_path = temp_dir.path().join(filename);
        fs::write(&notebook_path, notebook.to_string()).expect("Failed to write notebook");

        Self {
            temp_dir,
            notebook_path,
        }
    }

    fn path(&self) -> &str {
        self.notebook_path.to_str().unwrap()
    }

    fn dir(&self) -> &Path {
        self.temp_dir.path()
    }
}

fn folio(cwd: &Path) -> Command {
    let mut cmd = Command::cargo_bin("folio").expect("Failed to find folio binary");
    cmd.current_dir(cwd).env("FOLIO_KERNEL_PATH", cwd.join("kernels"));
    cmd
}

/// Notebook whose kernel is not installed anywhere.
fn notebook(with_outputs: bool) -> serde_json::Value {
    let outputs = if with_outputs {
        json!([{"output_type": "stream", "name": "stdout", "text": "1\n"}])
    } else {
        json!([])
    };
    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {"name": "folio-missing-kernel", "display_name": "Missing", "language": "python"}
        },
        "cells": [
            {"cell_type": "markdown", "id": "a", "metadata": {}, "source": "# Title"},
            {"cell_type": "code", "id": "b", "metadata": {}, "source": "print(1)",
             "outputs": outputs, "execution_count": null}
        ]
    })
}

// =============================================================================
// folio execute Tests
// =============================================================================

#[test]
fn test_execute_nonexistent_notebook() {
    let temp = TempDir::new().unwrap();
    folio(temp.path())
        .args(["execute", "/nonexistent/notebook.ipynb"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_execute_off_mode() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--mode", "off", nb.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("not executed"))
        .stdout(predicate::str::contains("Completed"));
}

#[test]
fn test_execute_auto_skips_executed_notebook() {
    let nb = TestNotebook::new("nb.ipynb", notebook(true));
    folio(nb.dir())
        .args(["execute", nb.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("not executed"));
}

#[test]
fn test_execute_missing_kernel_reports_failure() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--mode", "force", nb.path()])
        .assert()
        .failure()
        .stdout(predicate::str::contains("NoSuchKernel"))
        .stdout(predicate::str::contains("| Document"))
        .stderr(predicate::str::contains("1 notebook(s) failed"));
}

#[test]
fn test_execute_failure_report_in_output_dir() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    let out = nb.dir().join("out");
    folio(nb.dir())
        .args(["execute", "--mode", "force", "--output-dir"])
        .arg(&out)
        .arg(nb.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("traceback saved in"));

    let report = fs::read_to_string(out.join("reports").join("nb.err.log")).unwrap();
    assert!(report.contains("folio-missing-kernel"));
}

#[test]
fn test_execute_excluded_notebook() {
    let nb = TestNotebook::new("draft.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--mode", "force", "--exclude", "draft*", nb.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("not executed"));
}

#[test]
fn test_execute_writes_output_dir() {
    let nb = TestNotebook::new("nb.ipynb", notebook(true));
    let out = nb.dir().join("out");
    folio(nb.dir())
        .args(["execute", "--output-dir", out.to_str().unwrap(), nb.path()])
        .assert()
        .success();

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("nb.ipynb")).unwrap()).unwrap();
    assert_eq!(written["cells"][1]["outputs"][0]["name"], "stdout");
}

#[test]
fn test_execute_rejects_zero_timeout() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--timeout", "0", nb.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("execution_timeout"));
}

#[test]
fn test_execute_rejects_unknown_mode() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--mode", "sometimes", nb.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown execution mode"));
}

// =============================================================================
// folio cache Tests
// =============================================================================

#[test]
fn test_cache_list_without_cache() {
    let temp = TempDir::new().unwrap();
    folio(temp.path())
        .args(["cache", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No cache found"));
}

#[test]
fn test_cache_missing_kernel_is_not_stored() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    folio(nb.dir())
        .args(["execute", "--mode", "cache", nb.path()])
        .assert()
        .failure();

    folio(nb.dir())
        .args(["cache", "list", "--staged"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("NoSuchKernel").not());

    folio(nb.dir())
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cache is empty"));

    folio(nb.dir())
        .args(["cache", "unstage", nb.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Unstaged"));

    folio(nb.dir())
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared"));
}

#[test]
fn test_cache_show_staged_failure() {
    let nb = TestNotebook::new("nb.ipynb", notebook(false));
    let uri = nb.notebook_path.canonicalize().unwrap().display().to_string();
    let store = DiskCacheStore::open(nb.dir().join(".folio_cache")).unwrap();
    store.stage(&uri, "0123456789abcdef", None).unwrap();
    store
        .record_failure(&uri, "ZeroDivisionError", "1/0\nZeroDivisionError: division by zero")
        .unwrap();

    folio(nb.dir())
        .args(["cache", "show", nb.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed: ZeroDivisionError"))
        .stdout(predicate::str::contains("ZeroDivisionError: division by zero"));

    folio(nb.dir())
        .args(["cache", "show", "0123"])
        .assert()
        .success()
        .stdout(predicate::str::contains(uri.as_str()));

    folio(nb.dir())
        .args(["cache", "list", "--staged"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed: ZeroDivisionError"))
        .stdout(predicate::str::contains("division by zero"));
}

// =============================================================================
// folio kernels Tests
// =============================================================================

#[test]
fn test_kernels_lists_specs() {
    let temp = TempDir::new().unwrap();
    let spec_dir = temp.path().join("kernels").join("demo");
    fs::create_dir_all(&spec_dir).unwrap();
    fs::write(
        spec_dir.join("kernel.json"),
        json!({"argv": ["demo-kernel", "{connection_file}"], "display_name": "Demo", "language": "demo"})
            .to_string(),
    )
    .unwrap();

    folio(temp.path())
        .arg("kernels")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"));
}
