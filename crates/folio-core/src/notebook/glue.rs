//! Extraction of glued outputs.
//!
//! A code cell output carrying `metadata.scrapbook.name` is stored under that
//! key so other documents can reference it. When `scrapbook.mime_prefix` is
//! set, the prefix is stripped from the mime keys and the output is hidden
//! from the cell's displayed outputs.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::logger::{LogContext, NbLogger};

use super::{Cell, NotebookDocument, Output};

/// Glued outputs by key.
pub type GlueData = FxHashMap<String, Output>;

/// Extract the glue data of every code cell in the notebook.
///
/// Duplicate keys are reported as `glue` warnings at the cell's source line;
/// the last occurrence wins.
pub fn extract_glue_data(
    notebook: &mut NotebookDocument,
    cell_lines: &[usize],
    logger: &dyn NbLogger,
) -> GlueData {
    let mut data = GlueData::default();
    for (index, cell) in notebook.cells.iter_mut().enumerate() {
        if !cell.is_code() {
            continue;
        }
        for (key, output) in extract_glue_data_cell(cell) {
            if data.contains_key(&key) {
                logger.warning(
                    &format!("glue key {:?} duplicate", key),
                    &LogContext::subtype("glue").at_line(cell_lines.get(index).copied()),
                );
            }
            data.insert(key, output);
        }
    }
    data
}

/// Extract the glue data of a single cell, removing hidden outputs.
pub fn extract_glue_data_cell(cell: &mut Cell) -> Vec<(String, Output)> {
    let mut kept = Vec::with_capacity(cell.outputs.len());
    let mut glued = Vec::new();

    for output in cell.outputs.drain(..) {
        let scrapbook = output
            .metadata()
            .and_then(|meta| meta.get("scrapbook"))
            .and_then(Value::as_object)
            .cloned();
        let Some(scrapbook) = scrapbook else {
            kept.push(output);
            continue;
        };
        let Some(key) = scrapbook.get("name").and_then(Value::as_str) else {
            kept.push(output);
            continue;
        };
        let prefix = scrapbook
            .get("mime_prefix")
            .and_then(Value::as_str)
            .unwrap_or("");

        let output = strip_mime_prefix(output, prefix);
        if prefix.is_empty() {
            kept.push(output.clone());
        }
        glued.push((key.to_string(), output));
    }

    cell.outputs = kept;
    glued
}

fn strip_mime_prefix(output: Output, prefix: &str) -> Output {
    if prefix.is_empty() {
        return output;
    }
    let strip = |data: serde_json::Map<String, Value>| {
        data.into_iter()
            .map(|(mime, value)| {
                let mime = mime.strip_prefix(prefix).map(str::to_string).unwrap_or(mime);
                (mime, value)
            })
            .collect()
    };
    match output {
        Output::DisplayData { data, metadata } => Output::DisplayData {
            data: strip(data),
            metadata,
        },
        Output::ExecuteResult {
            execution_count,
            data,
            metadata,
        } => Output::ExecuteResult {
            execution_count,
            data: strip(data),
            metadata,
        },
        other => other,
    }
}
