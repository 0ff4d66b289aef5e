//! Jupyter messaging protocol messages.
//!
//! Framing and signing of messages on the kernel sockets live in
//! [`wire`](super::wire).

use chrono::{SecondsFormat, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::Result;

/// Protocol version advertised in message headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,

    /// Header of the request this message answers; `{}` on the wire when absent.
    #[serde(
        default,
        serialize_with = "serialize_parent",
        deserialize_with = "deserialize_parent"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub content: Value,
}

fn serialize_parent<S: Serializer>(parent: &Option<Header>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

fn deserialize_parent<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Header>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Null => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl Message {
    /// New request message in a session.
    pub fn request(session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: "folio".to_string(),
                date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: Map::new(),
            content,
        }
    }

    /// New message answering `parent`.
    pub fn reply(parent: &Message, msg_type: &str, content: Value) -> Self {
        let mut message = Self::request(&parent.header.session, msg_type, content);
        message.header.username = "kernel".to_string();
        message.parent_header = Some(parent.header.clone());
        message
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Id of the request this message answers.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// String field of the content.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// `execute_request` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequestContent {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default)]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

fn default_true() -> bool {
    true
}

impl ExecuteRequestContent {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }

    pub fn into_message(self, session: &str) -> Result<Message> {
        Ok(Message::request(session, "execute_request", serde_json::to_value(self)?))
    }
}

/// `execute_reply` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReplyContent {
    pub status: String,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
    #[serde(default)]
    pub traceback: Option<Vec<String>>,
}

impl ExecuteReplyContent {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `kernel_info_request` message.
pub fn kernel_info_request(session: &str) -> Message {
    Message::request(session, "kernel_info_request", json!({}))
}

/// `shutdown_request` message.
pub fn shutdown_request(session: &str) -> Message {
    Message::request(session, "shutdown_request", json!({ "restart": false }))
}

/// `interrupt_request` message, sent on the control channel.
pub fn interrupt_request(session: &str) -> Message {
    Message::request(session, "interrupt_request", json!({}))
}
