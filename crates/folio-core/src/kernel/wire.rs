//! Jupyter wire format.
//!
//! A message travels as a multipart ZeroMQ message:
//!
//! ```text
//! [routing ids...] "<IDS|MSG>" signature header parent_header metadata content [buffers...]
//! ```
//!
//! The signature is the hex HMAC-SHA256 of the four JSON frames, keyed with
//! the connection key. An empty key disables signing.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::error::{Error, Result};

use super::protocol::Message;

/// Frame separating routing ids from the message.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Largest accepted message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies messages with the connection key.
#[derive(Clone)]
pub struct Signer {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl Signer {
    pub fn new(key: &str) -> Self {
        Self {
            key: (!key.is_empty()).then(|| key.as_bytes().to_vec()),
        }
    }

    fn mac(&self, key: &[u8], frames: &[&[u8]]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| Error::Kernel(format!("invalid connection key: {}", e)))?;
        for frame in frames {
            mac.update(frame);
        }
        Ok(mac)
    }

    /// Hex signature of the JSON frames; empty when signing is disabled.
    pub fn sign(&self, frames: &[&[u8]]) -> Result<String> {
        match &self.key {
            Some(key) => Ok(hex::encode(self.mac(key, frames)?.finalize().into_bytes())),
            None => Ok(String::new()),
        }
    }

    /// Check a received signature.
    pub fn verify(&self, signature: &[u8], frames: &[&[u8]]) -> Result<()> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let expected = hex::decode(signature)
            .map_err(|_| Error::Kernel("malformed message signature".to_string()))?;
        self.mac(key, frames)?
            .verify_slice(&expected)
            .map_err(|_| Error::Kernel("invalid message signature".to_string()))
    }
}

/// Frames of a message, without routing ids.
pub fn encode(message: &Message, signer: &Signer) -> Result<Vec<Bytes>> {
    let header = serde_json::to_vec(&message.header)?;
    let parent = match &message.parent_header {
        Some(parent) => serde_json::to_vec(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = serde_json::to_vec(&message.metadata)?;
    let content = serde_json::to_vec(&message.content)?;
    let signature = signer.sign(&[&header, &parent, &metadata, &content])?;

    Ok(vec![
        Bytes::from_static(DELIMITER),
        Bytes::from(signature),
        Bytes::from(header),
        Bytes::from(parent),
        Bytes::from(metadata),
        Bytes::from(content),
    ])
}

/// Parse and verify a received multipart message.
pub fn decode(frames: &[Bytes], signer: &Signer) -> Result<Message> {
    let size: usize = frames.iter().map(Bytes::len).sum();
    if size > MAX_MESSAGE_SIZE {
        return Err(Error::Kernel(format!(
            "kernel message too large: {} bytes",
            size
        )));
    }

    let start = frames
        .iter()
        .position(|frame| frame.as_ref() == DELIMITER)
        .ok_or_else(|| Error::Deserialization("kernel message without delimiter".to_string()))?;
    let parts = &frames[start + 1..];
    let [signature, header, parent, metadata, content, ..] = parts else {
        return Err(Error::Deserialization(format!(
            "kernel message has {} frames after the delimiter, expected at least 5",
            parts.len()
        )));
    };
    signer.verify(signature, &[header, parent, metadata, content])?;

    let json = |frame: &Bytes| -> Result<Value> {
        serde_json::from_slice(frame)
            .map_err(|e| Error::Deserialization(format!("Failed to decode kernel message: {}", e)))
    };
    serde_json::from_value(json!({
        "header": json(header)?,
        "parent_header": json(parent)?,
        "metadata": json(metadata)?,
        "content": json(content)?,
    }))
    .map_err(|e| Error::Deserialization(format!("Invalid kernel message: {}", e)))
}
