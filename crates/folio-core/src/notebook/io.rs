//! Reading and writing `.ipynb` files.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

use super::NotebookDocument;

/// Read a notebook from a file.
pub fn read_notebook(path: impl AsRef<Path>) -> Result<NotebookDocument> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    read_notebook_str(&content)
        .map_err(|e| Error::Notebook(format!("{}: {}", path.display(), e)))
}

/// Parse a notebook from JSON text.
///
/// Only nbformat 4 documents are accepted.
pub fn read_notebook_str(content: &str) -> Result<NotebookDocument> {
    let notebook: NotebookDocument = serde_json::from_str(content)?;
    if notebook.nbformat != 4 {
        return Err(Error::Notebook(format!(
            "unsupported nbformat version {}",
            notebook.nbformat
        )));
    }
    notebook.source_map()?;
    Ok(notebook)
}

/// Write a notebook to a file, creating parent directories.
pub fn write_notebook(notebook: &NotebookDocument, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut json = serde_json::to_string_pretty(notebook)?;
    json.push('\n');
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::{Cell, Output};

    #[test]
    fn test_write_and_read_back() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out").join("nb.ipynb");

        let mut nb = NotebookDocument::with_cells(vec![Cell::markdown("# T"), Cell::code("print(1)")]);
        nb.cells[1].outputs.push(Output::stdout("1\n"));
        nb.cells[1].execution_count = Some(1);

        write_notebook(&nb, &path).unwrap();
        let loaded = read_notebook(&path).unwrap();
        assert_eq!(loaded, nb);
    }

    #[test]
    fn test_rejects_old_format() {
        let result = read_notebook_str(r#"{"nbformat":3,"nbformat_minor":0,"metadata":{},"cells":[]}"#);
        assert!(matches!(result, Err(Error::Notebook(_))));
    }
}
