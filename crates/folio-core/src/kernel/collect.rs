//! Assembling cell outputs from kernel broadcasts.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};

use crate::notebook::{Metadata, MimeBundle, Output};

use super::KernelError;
use super::protocol::Message;

/// Mime type of serialized widget state.
pub const WIDGET_STATE_MIMETYPE: &str = "application/vnd.jupyter.widget-state+json";

const WIDGET_TARGET: &str = "jupyter.widget";

/// Widget models announced over comm messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidgetState {
    models: FxHashMap<String, Map<String, Value>>,
    order: Vec<String>,
}

impl WidgetState {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Track `comm_open` and `comm_msg` updates of widget comms.
    pub fn handle(&mut self, message: &Message) {
        let content = &message.content;
        let Some(comm_id) = content.get("comm_id").and_then(Value::as_str) else {
            return;
        };
        match message.msg_type() {
            "comm_open" => {
                if content.get("target_name").and_then(Value::as_str) != Some(WIDGET_TARGET) {
                    return;
                }
                let state = content
                    .pointer("/data/state")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                if !self.models.contains_key(comm_id) {
                    self.order.push(comm_id.to_string());
                }
                self.models.insert(comm_id.to_string(), state);
            }
            "comm_msg" => {
                let Some(model) = self.models.get_mut(comm_id) else {
                    return;
                };
                if content.pointer("/data/method").and_then(Value::as_str) != Some("update") {
                    return;
                }
                if let Some(update) = content.pointer("/data/state").and_then(Value::as_object) {
                    model.extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            _ => {}
        }
    }

    /// Widget state document, or `None` when no widget was created.
    pub fn to_value(&self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        let mut state = Map::new();
        for comm_id in &self.order {
            let Some(model) = self.models.get(comm_id) else {
                continue;
            };
            let field = |key: &str| model.get(key).cloned().unwrap_or(Value::Null);
            state.insert(
                comm_id.clone(),
                json!({
                    "model_name": field("_model_name"),
                    "model_module": field("_model_module"),
                    "model_module_version": field("_model_module_version"),
                    "state": model,
                }),
            );
        }
        Some(json!({
            "state": state,
            "version_major": 2,
            "version_minor": 0,
        }))
    }
}

/// Collects the outputs broadcast for one request.
#[derive(Debug, Default)]
pub struct OutputCollector {
    outputs: Vec<Output>,
    display_positions: FxHashMap<String, Vec<usize>>,
    clear_before_next: bool,
    error: Option<KernelError>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one broadcast message.
    pub fn handle(&mut self, message: &Message, widgets: &mut WidgetState) {
        let content = &message.content;
        match message.msg_type() {
            "stream" => {
                let name = content
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout")
                    .to_string();
                let text = content
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.push(Output::Stream { name, text });
            }
            "display_data" => {
                let output = Output::DisplayData {
                    data: mime_bundle(content, "data"),
                    metadata: mime_bundle(content, "metadata"),
                };
                let position = self.push(output);
                if let Some(display_id) = content.pointer("/transient/display_id").and_then(Value::as_str) {
                    self.display_positions
                        .entry(display_id.to_string())
                        .or_default()
                        .push(position);
                }
            }
            "update_display_data" => {
                let Some(display_id) = content.pointer("/transient/display_id").and_then(Value::as_str) else {
                    return;
                };
                let positions = self.display_positions.get(display_id).cloned().unwrap_or_default();
                for position in positions {
                    if let Some(Output::DisplayData { data, metadata }) = self.outputs.get_mut(position) {
                        *data = mime_bundle(content, "data");
                        *metadata = mime_bundle(content, "metadata");
                    }
                }
            }
            "execute_result" => {
                let execution_count = content
                    .get("execution_count")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32);
                self.push(Output::ExecuteResult {
                    execution_count,
                    data: mime_bundle(content, "data"),
                    metadata: mime_bundle(content, "metadata"),
                });
            }
            "error" => {
                let error = kernel_error(content);
                self.push(error.to_output());
                self.error = Some(error);
            }
            "clear_output" => {
                if content.get("wait").and_then(Value::as_bool).unwrap_or(false) {
                    self.clear_before_next = true;
                } else {
                    self.clear();
                }
            }
            "comm_open" | "comm_msg" => widgets.handle(message),
            other => tracing::trace!("Ignoring kernel message {}", other),
        }
    }

    fn push(&mut self, output: Output) -> usize {
        if self.clear_before_next {
            self.clear();
        }
        self.outputs.push(output);
        self.outputs.len() - 1
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.display_positions.clear();
        self.clear_before_next = false;
    }

    /// Error broadcast for the request, if any.
    pub fn error(&self) -> Option<&KernelError> {
        self.error.as_ref()
    }

    pub fn into_outputs(self) -> (Vec<Output>, Option<KernelError>) {
        (self.outputs, self.error)
    }
}

/// Build a kernel error from `error` or `execute_reply` content.
pub(crate) fn kernel_error(content: &Value) -> KernelError {
    let text = |key: &str| {
        content
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    KernelError {
        ename: text("ename"),
        evalue: text("evalue"),
        traceback: content
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn mime_bundle(content: &Value, key: &str) -> MimeBundle {
    content
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Metadata::new)
}
