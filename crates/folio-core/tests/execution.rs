//! Integration tests for client selection and whole-notebook execution.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{FakeKernelLauncher, TestNotebook, notebook, stdout_of};
use folio_core::{
    Cell, ClientKind, Error, ExecutionConfig, ExecutionContext, ExecutionMode, Output,
    RecordingLogger, create_client,
};

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    launcher: FakeKernelLauncher,
    logger: Arc<RecordingLogger>,
    ctx: ExecutionContext,
    reports: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_launcher(FakeKernelLauncher::new())
    }

    fn with_launcher(launcher: FakeKernelLauncher) -> Self {
        let logger = Arc::new(RecordingLogger::new());
        let reports = TempDir::new().expect("Failed to create reports directory");
        let ctx = ExecutionContext::new(logger.clone())
            .with_launcher(Arc::new(launcher.clone()))
            .with_reports_dir(reports.path());
        Self {
            launcher,
            logger,
            ctx,
            reports,
        }
    }
}

fn config(mode: ExecutionMode) -> ExecutionConfig {
    ExecutionConfig::with_mode(mode)
}

// =============================================================================
// Direct execution
// =============================================================================

#[test]
fn test_force_print_then_divide_by_zero() {
    let nb = notebook(&["print(1)", "1/0"]);
    let file = TestNotebook::new("scenario.ipynb", &nb);
    let h = Harness::new();

    let mut session = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .expect("create client");
    assert_eq!(session.kind(), ClientKind::Direct);

    let (count, outputs) = session.code_cell_outputs(0).unwrap();
    assert_eq!(count, Some(1));
    assert_eq!(stdout_of(outputs), "1\n");

    let (_, outputs) = session.code_cell_outputs(1).unwrap();
    assert!(matches!(&outputs[0], Output::Error { ename, .. } if ename == "ZeroDivisionError"));

    let outcome = session.finish();
    let result = outcome.exec_metadata.expect("execution result");
    assert!(!result.succeeded);
    assert_eq!(result.method, ExecutionMode::Force);
    assert_eq!(result.error.as_deref(), Some("ZeroDivisionError"));
    assert!(result.traceback.unwrap().contains("1/0"));
    assert!(result.runtime.is_some());

    let warnings = h.logger.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.starts_with("Executing notebook failed: ZeroDivisionError"));
    assert_eq!(warnings[0].subtype.as_deref(), Some("exec"));
}

#[test]
fn test_error_stops_remaining_cells() {
    let nb = notebook(&["print(1)", "1/0", "print(2)", "print(3)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let mut session =
        create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx).unwrap();
    assert!(!session.code_cell_outputs(1).unwrap().1.is_empty());
    for index in [2, 3] {
        let (count, outputs) = session.code_cell_outputs(index).unwrap();
        assert_eq!(count, None);
        assert!(outputs.is_empty());
    }
    assert_eq!(h.launcher.executed(), vec!["print(1)", "1/0"]);
    assert!(!session.finish().exec_metadata.unwrap().succeeded);
}

#[test]
fn test_allow_errors_runs_every_cell() {
    let nb = notebook(&["1/0", "print(2)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        allow_errors: true,
        ..config(ExecutionMode::Force)
    };

    let session = create_client(nb, file.source(), &config, &h.ctx).unwrap();
    let outcome = session.finish();
    assert!(outcome.exec_metadata.unwrap().succeeded);
    assert_eq!(stdout_of(&outcome.notebook.cells[1].outputs), "2\n");
}

#[test]
fn test_raise_on_error_propagates() {
    let nb = notebook(&["1/0"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        raise_on_error: true,
        ..config(ExecutionMode::Force)
    };

    let err = create_client(nb, file.source(), &config, &h.ctx).err().expect("error");
    assert!(matches!(err, Error::Execution { ref error, .. } if error == "ZeroDivisionError"));
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.launcher.shutdowns(), 1);
}

#[test]
fn test_cell_tags() {
    let mut skipped = Cell::code("1/0").with_tag("skip-execution");
    skipped.outputs = vec![Output::stdout("precomputed")];
    skipped.execution_count = Some(7);
    let nb = folio_core::NotebookDocument::with_cells(vec![
        skipped,
        Cell::code("1/0").with_tag("raises-exception"),
        Cell::code("print(3)"),
    ]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let outcome = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .unwrap()
        .finish();
    assert!(outcome.exec_metadata.unwrap().succeeded);
    assert_eq!(stdout_of(&outcome.notebook.cells[0].outputs), "precomputed");
    assert_eq!(outcome.notebook.cells[0].execution_count, Some(7));
    assert!(outcome.notebook.cells[1].outputs[0].is_error());
    assert_eq!(h.launcher.executed().len(), 2);
}

#[test]
fn test_timeout_is_cell_error() {
    let nb = notebook(&["sleep(5)", "print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        timeout: Some(1),
        ..config(ExecutionMode::Force)
    };

    let outcome = create_client(nb, file.source(), &config, &h.ctx)
        .unwrap()
        .finish();
    let result = outcome.exec_metadata.unwrap();
    assert_eq!(result.error.as_deref(), Some("CellTimeoutError"));
    assert!(outcome.notebook.cells[0].outputs[0].is_error());
    assert!(outcome.notebook.cells[1].outputs.is_empty());
}

#[test]
fn test_unrepresentable_timeout_runs() {
    let nb = notebook(&["sleep(1)", "print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    for timeout in [Some(u64::MAX), None] {
        let config = ExecutionConfig {
            timeout,
            ..config(ExecutionMode::Force)
        };
        let outcome = create_client(nb.clone(), file.source(), &config, &h.ctx)
            .unwrap()
            .finish();
        assert!(outcome.exec_metadata.unwrap().succeeded);
        assert_eq!(stdout_of(&outcome.notebook.cells[1].outputs), "1\n");
    }
}

#[test]
fn test_unreached_cells_keep_outputs() {
    let mut nb = notebook(&["1/0", "print(2)"]);
    nb.cells[1].outputs = vec![Output::stdout("stale\n")];
    nb.cells[1].execution_count = Some(2);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let outcome = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .unwrap()
        .finish();
    assert!(!outcome.exec_metadata.unwrap().succeeded);
    assert_eq!(stdout_of(&outcome.notebook.cells[1].outputs), "stale\n");
    assert_eq!(h.launcher.executed(), vec!["1/0"]);
}

#[test]
fn test_failure_traceback_saved_to_report() {
    let nb = notebook(&["1/0"]);
    let file = TestNotebook::new("broken.ipynb", &nb);
    let h = Harness::new();

    create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .unwrap()
        .finish();
    let report = h.reports.path().join("broken.err.log");
    let traceback = std::fs::read_to_string(&report).expect("report written");
    assert!(traceback.contains("1/0"));
    assert!(traceback.contains("ZeroDivisionError"));

    let warnings = h.logger.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains(&report.display().to_string()));
}

#[test]
fn test_language_info_and_glue() {
    let nb = notebook(&["x = 6", "display(\"answer\", 42)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx).unwrap();
    assert_eq!(session.source_code_lexer().as_deref(), Some("ipython3"));
    assert_eq!(session.nb_metadata()["language_info"]["name"], "python");
    assert_eq!(
        session.glue_data()["answer"].text_plain().as_deref(),
        Some("42")
    );
    // Glued outputs without a mime prefix stay visible.
    assert_eq!(session.notebook().cells[1].outputs.len(), 1);
}

#[test]
fn test_merge_streams() {
    let nb = notebook(&["print(1)\nprint(2)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        merge_streams: true,
        ..config(ExecutionMode::Force)
    };

    let outcome = create_client(nb, file.source(), &config, &h.ctx)
        .unwrap()
        .finish();
    assert_eq!(outcome.notebook.cells[0].outputs, vec![Output::stdout("1\n2\n")]);
}

#[test]
fn test_kernel_alias() {
    let mut nb = notebook(&["print(1)"]);
    nb.metadata
        .insert("kernelspec".to_string(), json!({"name": "python3", "language": "python"}));
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        kernel_aliases: BTreeMap::from([("python.*".to_string(), "fake".to_string())]),
        ..config(ExecutionMode::Force)
    };

    create_client(nb, file.source(), &config, &h.ctx).unwrap().finish();
    assert_eq!(h.launcher.kernel_names(), vec!["fake"]);
}

#[test]
fn test_launch_failure_is_reported() {
    let nb = notebook(&["print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::with_launcher(FakeKernelLauncher::failing());

    let outcome = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .unwrap()
        .finish();
    let result = outcome.exec_metadata.unwrap();
    assert!(!result.succeeded);
    assert_eq!(result.error.as_deref(), Some("NoSuchKernel"));
}

// =============================================================================
// Selection
// =============================================================================

#[test]
fn test_auto_skips_executed_notebook() {
    let mut nb = notebook(&["print(1)"]);
    nb.cells[0].outputs.push(Output::stdout("1\n"));
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Auto), &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::ReadOnly);
    assert!(session.exec_metadata().is_none());
    assert!(h.logger.contains("Skipped execution in 'auto' mode (all outputs present)"));
    drop(session);
    assert_eq!(h.launcher.launches(), 0);
}

#[test]
fn test_auto_executes_missing_outputs() {
    let nb = notebook(&["print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Auto), &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::Direct);
    assert_eq!(session.exec_metadata().unwrap().method, ExecutionMode::Auto);
}

#[test]
fn test_excluded_notebook_is_not_executed() {
    let nb = notebook(&["1/0"]);
    let file = TestNotebook::new("skip_me.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        exclude_patterns: vec!["skip_*.ipynb".to_string()],
        ..config(ExecutionMode::Force)
    };

    let session = create_client(nb, file.source(), &config, &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::ReadOnly);
    assert!(h.logger.contains("Excluded from execution by pattern: \"skip_*.ipynb\""));
    assert_eq!(h.launcher.launches(), 0);
}

#[test]
fn test_off_never_executes() {
    let nb = notebook(&["print(1)"]);
    let h = Harness::new();

    let session = create_client(nb, "<string>", &config(ExecutionMode::Off), &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::ReadOnly);
    assert_eq!(h.launcher.launches(), 0);
}

#[test]
fn test_pathless_source_requires_temp_dir() {
    let h = Harness::new();
    for mode in [ExecutionMode::Force, ExecutionMode::Inline] {
        let result = create_client(notebook(&["print(1)"]), "<string>", &config(mode), &h.ctx);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
    assert_eq!(h.launcher.launches(), 0);

    let config = ExecutionConfig {
        in_temp: true,
        ..config(ExecutionMode::Force)
    };
    let outcome = create_client(notebook(&["print(1)"]), "<string>", &config, &h.ctx)
        .unwrap()
        .finish();
    assert!(outcome.exec_metadata.unwrap().succeeded);
}

#[test]
fn test_notebook_override_selects_mode() {
    let mut nb = notebook(&["print(1)"]);
    nb.metadata
        .insert("folio".to_string(), json!({"execution_mode": "off"}));
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::ReadOnly);
}

#[test]
fn test_unknown_override_warns() {
    let mut nb = notebook(&["print(1)"]);
    nb.metadata
        .insert("folio".to_string(), json!({"execution_excludepatterns": ["*"]}));
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx).unwrap();
    assert_eq!(session.kind(), ClientKind::Direct);
    let warnings = h.logger.warnings();
    assert_eq!(warnings[0].subtype.as_deref(), Some("config"));
}

// =============================================================================
// Resource cleanup
// =============================================================================

#[test]
fn test_kernel_stopped_exactly_once() {
    let nb = notebook(&["print(1)", "print(2)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    let session = create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx).unwrap();
    session.finish();
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.launcher.shutdowns(), 1);
}

#[test]
fn test_temp_dir_removed() {
    let nb = notebook(&["print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();
    let config = ExecutionConfig {
        in_temp: true,
        ..config(ExecutionMode::Force)
    };

    create_client(nb, file.source(), &config, &h.ctx).unwrap().finish();
    let cwds = h.launcher.cwds();
    assert_eq!(cwds.len(), 1);
    assert_ne!(cwds[0], file.root().canonicalize().unwrap());
    assert!(!cwds[0].exists());
    assert!(h.logger.contains("Executing notebook using temporary CWD"));
}

#[test]
fn test_failed_shutdown_is_logged() {
    let nb = notebook(&["print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::with_launcher(FakeKernelLauncher::failing_shutdown());
    let config = ExecutionConfig {
        in_temp: true,
        ..config(ExecutionMode::Force)
    };

    let outcome = create_client(nb, file.source(), &config, &h.ctx).unwrap().finish();
    assert!(outcome.exec_metadata.unwrap().succeeded);

    let warnings = h.logger.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.starts_with("Failed to shut down kernel"));
    assert_eq!(warnings[0].subtype.as_deref(), Some("exec"));
    assert_eq!(h.launcher.shutdown_calls(), 1);

    let cwds = h.launcher.cwds();
    assert_eq!(cwds.len(), 1);
    assert!(!cwds[0].exists());
}

#[test]
fn test_local_cwd_is_source_parent() {
    let nb = notebook(&["print(1)"]);
    let file = TestNotebook::new("nb.ipynb", &nb);
    let h = Harness::new();

    create_client(nb, file.source(), &config(ExecutionMode::Force), &h.ctx)
        .unwrap()
        .finish();
    assert_eq!(h.launcher.cwds(), vec![file.root().canonicalize().unwrap()]);
    assert!(h.logger.contains("Executing notebook using local CWD"));
}
