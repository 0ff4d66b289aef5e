//! In-memory notebook model (nbformat 4).
//!
//! `NotebookDocument` is the contract boundary between the reader, the
//! execution clients and the renderer. Execution mutates it in place
//! (outputs, execution counts, `language_info`); the renderer only ever
//! receives read-only views of cell outputs.

mod glue;
mod io;
mod streams;

pub use glue::{GlueData, extract_glue_data, extract_glue_data_cell};
pub use io::{read_notebook, read_notebook_str, write_notebook};
pub use streams::coalesce_streams;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arbitrary JSON metadata mapping.
pub type Metadata = Map<String, Value>;

/// Mime type -> representation for one output.
pub type MimeBundle = Map<String, Value>;

/// Kernel name used when a notebook declares none.
pub const DEFAULT_KERNEL_NAME: &str = "python3";

/// Cell tag that prevents a code cell from being executed.
pub const TAG_SKIP_EXECUTION: &str = "skip-execution";

/// Cell tag marking a code cell whose error is expected.
pub const TAG_RAISES_EXCEPTION: &str = "raises-exception";

/// A Jupyter notebook document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookDocument {
    /// Major format version (always 4).
    pub nbformat: u32,

    /// Minor format version.
    pub nbformat_minor: u32,

    /// Document level metadata (kernelspec, language_info, source_map, ...).
    #[serde(default)]
    pub metadata: Metadata,

    /// Ordered notebook cells.
    #[serde(default)]
    pub cells: Vec<Cell>,
}

/// Kind of a notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Markdown,
    Code,
    Raw,
}

/// A single notebook cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Cell type.
    pub cell_type: CellType,

    /// Optional cell id (nbformat >= 4.5).
    pub id: Option<String>,

    /// Cell metadata.
    pub metadata: Metadata,

    /// Cell source text.
    pub source: String,

    /// Outputs (code cells only).
    pub outputs: Vec<Output>,

    /// Execution count (code cells only).
    pub execution_count: Option<u32>,

    /// Attachments (markdown/raw cells only).
    pub attachments: Option<Value>,
}

/// A code cell output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type")]
pub enum Output {
    /// Standard output/error.
    #[serde(rename = "stream")]
    Stream {
        name: String,
        #[serde(with = "multiline")]
        text: String,
    },

    /// Rich display data.
    #[serde(rename = "display_data")]
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
    },

    /// Result of the last expression of a cell.
    #[serde(rename = "execute_result")]
    ExecuteResult {
        execution_count: Option<u32>,
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
    },

    /// Error raised by the cell.
    #[serde(rename = "error")]
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// Create a stdout stream output.
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    /// Create a plain text `execute_result`.
    pub fn text_result(execution_count: Option<u32>, text: impl Into<String>) -> Self {
        let mut data = MimeBundle::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        Output::ExecuteResult {
            execution_count,
            data,
            metadata: Metadata::new(),
        }
    }

    /// The mime bundle of display outputs.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    /// The output metadata of display outputs.
    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Output::DisplayData { metadata, .. } | Output::ExecuteResult { metadata, .. } => {
                Some(metadata)
            }
            _ => None,
        }
    }

    /// Representation for a mime type, joining list-of-lines values.
    pub fn mime_text(&self, mime: &str) -> Option<String> {
        self.data()
            .and_then(|data| data.get(mime))
            .and_then(join_text)
    }

    /// `text/plain` representation, if any.
    pub fn text_plain(&self) -> Option<String> {
        self.mime_text("text/plain")
    }

    /// Whether this is an error output.
    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}

/// Join a JSON string or list of strings.
pub(crate) fn join_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        _ => None,
    }
}

impl Cell {
    /// Create a code cell.
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Code,
            id: None,
            metadata: Metadata::new(),
            source: source.into(),
            outputs: Vec::new(),
            execution_count: None,
            attachments: None,
        }
    }

    /// Create a markdown cell.
    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Markdown,
            ..Self::code(source)
        }
    }

    /// Create a raw cell.
    pub fn raw(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Raw,
            ..Self::code(source)
        }
    }

    /// Whether this is a code cell.
    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    /// Tags from `metadata.tags`.
    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the cell carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(&tag)
    }

    /// Add a tag to `metadata.tags`.
    pub fn with_tag(mut self, tag: &str) -> Self {
        let tags = self
            .metadata
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(tags) = tags {
            tags.push(Value::String(tag.to_string()));
        }
        self
    }

    /// Clear execution state.
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
        self.execution_count = None;
    }
}

impl NotebookDocument {
    /// Create an empty nbformat 4.5 notebook.
    pub fn new() -> Self {
        Self {
            nbformat: 4,
            nbformat_minor: 5,
            metadata: Metadata::new(),
            cells: Vec::new(),
        }
    }

    /// Create a notebook from cells.
    pub fn with_cells(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            ..Self::new()
        }
    }

    /// Iterate over `(index, cell)` for code cells.
    pub fn code_cells(&self) -> impl Iterator<Item = (usize, &Cell)> {
        self.cells.iter().enumerate().filter(|(_, c)| c.is_code())
    }

    /// Whether every code cell already has at least one output.
    pub fn all_code_cells_have_outputs(&self) -> bool {
        self.code_cells().all(|(_, cell)| !cell.outputs.is_empty())
    }

    /// `metadata.kernelspec`, if present.
    pub fn kernelspec(&self) -> Option<&Metadata> {
        self.metadata.get("kernelspec").and_then(Value::as_object)
    }

    /// Kernel name declared by the notebook, defaulting to `python3`.
    pub fn kernel_name(&self) -> String {
        self.kernelspec()
            .and_then(|spec| spec.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_KERNEL_NAME)
            .to_string()
    }

    /// `metadata.language_info`, if present.
    pub fn language_info(&self) -> Option<&Metadata> {
        self.metadata.get("language_info").and_then(Value::as_object)
    }

    /// Lexer name for code cell sources.
    ///
    /// Prefers `language_info.pygments_lexer`, then `language_info.name`,
    /// then `kernelspec.language`.
    pub fn source_code_lexer(&self) -> Option<String> {
        let from_langinfo = self.language_info().and_then(|info| {
            info.get("pygments_lexer")
                .or_else(|| info.get("name"))
                .and_then(Value::as_str)
        });
        from_langinfo
            .or_else(|| {
                self.kernelspec()
                    .and_then(|spec| spec.get("language"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
    }

    /// Validated `metadata.source_map`.
    ///
    /// Returns `Ok(None)` when absent. The map must have one entry per cell and
    /// increase monotonically.
    pub fn source_map(&self) -> crate::Result<Option<Vec<usize>>> {
        let Some(value) = self.metadata.get("source_map") else {
            return Ok(None);
        };
        let entries = value
            .as_array()
            .ok_or_else(|| crate::Error::Notebook("source_map must be a list".to_string()))?;
        let lines = entries
            .iter()
            .map(|v| {
                v.as_u64().map(|n| n as usize).ok_or_else(|| {
                    crate::Error::Notebook(format!("source_map entry is not a line: {}", v))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        if lines.len() < self.cells.len() {
            return Err(crate::Error::Notebook(format!(
                "source_map has {} entries for {} cells",
                lines.len(),
                self.cells.len()
            )));
        }
        if lines.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(crate::Error::Notebook(
                "source_map must increase monotonically".to_string(),
            ));
        }
        Ok(Some(lines))
    }
}

impl Default for NotebookDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire shape of a cell; code cells always carry `outputs` and `execution_count`.
#[derive(Serialize, Deserialize)]
struct RawCell {
    cell_type: CellType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(with = "multiline")]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<Output>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_option"
    )]
    execution_count: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachments: Option<Value>,
}

fn present_option<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer).map(Some)
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let is_code = self.is_code();
        RawCell {
            cell_type: self.cell_type,
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            source: self.source.clone(),
            outputs: is_code.then(|| self.outputs.clone()),
            execution_count: is_code.then_some(self.execution_count),
            attachments: if is_code { None } else { self.attachments.clone() },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawCell::deserialize(deserializer)?;
        if raw.cell_type != CellType::Code && raw.outputs.as_ref().is_some_and(|o| !o.is_empty()) {
            return Err(de::Error::custom("only code cells may have outputs"));
        }
        Ok(Cell {
            cell_type: raw.cell_type,
            id: raw.id,
            metadata: raw.metadata,
            source: raw.source,
            outputs: raw.outputs.unwrap_or_default(),
            execution_count: raw.execution_count.flatten(),
            attachments: raw.attachments,
        })
    }
}

/// Multiline strings: read as a string or a list of lines, written as lines.
mod multiline {
    use serde::de::Deserializer;
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Lines(Vec<String>),
    }

    pub fn serialize<S: Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        lines.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(s) => s,
            Repr::Lines(lines) => lines.concat(),
        })
    }
}
