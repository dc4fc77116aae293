//! JSON wire protocol shared by client connections and relay links.
//!
//! Every WebSocket text (or binary) message carries exactly one frame:
//! ```text
//! {"kind":"handshake","username":"alice"}
//! {"kind":"message","id":"…","sender":"alice","recipient":"bob",
//!  "content":"hi","timestamp":"2026-01-01T00:00:00Z","read":false}
//! ```
//!
//! The `kind` tag is authoritative. Untagged frames from older clients are
//! still accepted: an object with a non-empty `username` and none of the
//! message fields is a handshake, anything else must parse as a message.
//! The decision is made once, in [`Frame::decode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Field names that mark an untagged frame as a message.
const MESSAGE_FIELDS: &[&str] = &["id", "sender", "recipient", "content", "timestamp", "read"];

/// A direct chat message.
///
/// `id` is `None` until the message store assigns one at first
/// persistence; it travels with the message from then on (relay frames,
/// pushes to the recipient, backlog replay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    /// Create an unpersisted message stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp: Utc::now(),
            read: false,
        }
    }

    /// Builder-style id assignment (tests and relay fixtures).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of a client connection: identifies the user.
    Handshake { username: String },
    /// A chat message, from a client, a relay link, or pushed by the server.
    Message(Message),
}

impl Frame {
    pub fn handshake(username: impl Into<String>) -> Self {
        Frame::Handshake {
            username: username.into(),
        }
    }

    pub fn message(message: Message) -> Self {
        Frame::Message(message)
    }

    /// Serialize to the tagged JSON form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse one frame, tagged or legacy untagged.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let frame = if fields.contains_key("kind") {
            serde_json::from_value(Value::Object(fields))
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?
        } else if is_untagged_handshake(&fields) {
            let username = fields
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Frame::Handshake { username }
        } else {
            let message: Message = serde_json::from_value(Value::Object(fields))
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
            Frame::Message(message)
        };

        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Frame::Handshake { username } if username.trim().is_empty() => {
                Err(ProtocolError::EmptyUsername)
            }
            Frame::Message(msg) if msg.recipient.trim().is_empty() => {
                Err(ProtocolError::MissingRecipient)
            }
            _ => Ok(()),
        }
    }

    /// The message inside a `Message` frame.
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        match self {
            Frame::Message(msg) => Ok(msg),
            Frame::Handshake { .. } => Err(ProtocolError::InvalidFrameKind("handshake")),
        }
    }
}

fn is_untagged_handshake(fields: &Map<String, Value>) -> bool {
    let has_username = fields
        .get("username")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.is_empty());
    has_username && !MESSAGE_FIELDS.iter().any(|f| fields.contains_key(*f))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Handshake carries an empty username")]
    EmptyUsername,
    #[error("Message has no recipient")]
    MissingRecipient,
    #[error("Unexpected {0} frame")]
    InvalidFrameKind(&'static str),
    #[error("WebSocket error: {0}")]
    Transport(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
