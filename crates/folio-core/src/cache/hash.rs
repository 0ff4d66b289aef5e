//! Content hashing of executable notebook content.

use serde_json::{Map, Value, json};
use xxhash_rust::xxh3::xxh3_128;

use crate::config::ExecutionConfig;
use crate::notebook::{NotebookDocument, TAG_RAISES_EXCEPTION, TAG_SKIP_EXECUTION};

/// Kernelspec keys that change how a notebook executes.
const HASHED_KERNELSPEC_KEYS: &[&str] = &["name", "language"];

/// Cell tags that change how a cell executes.
const HASHED_TAGS: &[&str] = &[TAG_SKIP_EXECUTION, TAG_RAISES_EXCEPTION];

/// Hash the executable content of a notebook.
///
/// Covers the nbformat major version, the kernelspec name and language, and
/// for each code cell its source and execution-affecting tags. Markdown and
/// raw cells, outputs, execution counts and all other metadata are excluded,
/// so documentation edits keep the same hash.
pub fn content_hash(notebook: &NotebookDocument) -> String {
    format!("{:032x}", xxh3_128(canonical_form(notebook).as_bytes()))
}

/// Key under which the outcome of executing a notebook is staged.
///
/// Extends the content hash with the settings that decide whether the same
/// code fails: `allow_errors`, the timeout, the kernel actually launched after
/// aliasing, and whether the working directory is temporary. `config` is the
/// configuration after notebook overrides.
pub fn execution_key(notebook: &NotebookDocument, config: &ExecutionConfig) -> String {
    let key = json!({
        "content": content_hash(notebook),
        "allow_errors": config.allow_errors,
        "timeout": config.timeout,
        "kernel": config.resolve_kernel_name(&notebook.kernel_name()),
        "in_temp": config.in_temp,
    });
    format!("{:032x}", xxh3_128(key.to_string().as_bytes()))
}

/// Canonical JSON text that is hashed.
fn canonical_form(notebook: &NotebookDocument) -> String {
    let kernelspec: Map<String, Value> = notebook
        .kernelspec()
        .map(|spec| {
            spec.iter()
                .filter(|(key, _)| HASHED_KERNELSPEC_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let cells: Vec<Value> = notebook
        .code_cells()
        .map(|(_, cell)| {
            let tags: Vec<&str> = HASHED_TAGS
                .iter()
                .copied()
                .filter(|tag| cell.has_tag(tag))
                .collect();
            json!({ "source": cell.source, "tags": tags })
        })
        .collect();

    // serde_json maps are sorted, so the text is stable.
    json!({
        "nbformat": notebook.nbformat,
        "kernelspec": kernelspec,
        "cells": cells,
    })
    .to_string()
}
