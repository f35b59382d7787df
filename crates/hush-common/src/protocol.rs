//! Relay wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. Variant names are snake_case on the
//! wire, field names are camelCase. Payloads such as `content` and `data` are opaque
//! ciphertext strings; the relay never looks inside them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of call a participant asks to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only.
    Voice,
    /// Audio and camera video.
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" | "audio" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            other => Err(ProtocolError::Malformed(format!("unknown call type: {other}"))),
        }
    }
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a fresh room and join it.
    CreateGroup,

    /// Join a room, creating it if nobody is in it yet.
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: String },

    /// Leave the current room, if any.
    LeaveGroup,

    /// Encrypted chat text for the rest of the room.
    ChatMessage {
        content: String,
        /// Ignored by the relay, which stamps the real sender handle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Ask whether a call may start in the current room.
    #[serde(rename_all = "camelCase")]
    StartCall { call_type: CallType },

    /// Encrypted offer/answer/candidate for the rest of the room.
    EncryptedSignaling { data: String },
}

impl ClientMessage {
    /// Every `type` tag a client may send.
    pub const KNOWN_TYPES: [&'static str; 6] = [
        "create_group",
        "join_group",
        "leave_group",
        "chat_message",
        "start_call",
        "encrypted_signaling",
    ];

    /// Parse one inbound text frame.
    ///
    /// Distinguishes non-JSON or structurally invalid input from a well-formed frame
    /// carrying a `type` the relay does not know.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing message type".into()))?;

        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once per connection with the handle the relay assigned to it.
    #[serde(rename_all = "camelCase")]
    Welcome { member_id: String },

    #[serde(rename_all = "camelCase")]
    GroupCreated { group_id: String },

    #[serde(rename_all = "camelCase")]
    JoinedGroup { group_id: String },

    #[serde(rename_all = "camelCase")]
    LeftGroup { group_id: String },

    ChatMessage {
        content: String,
        sender: String,
        timestamp: i64,
    },

    #[serde(rename_all = "camelCase")]
    CallAllowed { call_type: CallType },

    EncryptedSignaling { data: String, sender: String },

    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Failure to read or write a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}
