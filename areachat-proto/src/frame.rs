//! Live-channel frames and their JSON text codec.
//!
//! Every frame is a JSON object carrying a `type` tag. Client frames flow
//! towards the server; server frames are either control replies to the
//! handshake and heartbeat, or [`InboundEvent`]s pushed for the area.

use serde::{Deserialize, Serialize};

use crate::event::InboundEvent;

/// Largest text frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame has no `type` tag or is not a JSON object.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Frame carries a `type` tag this build does not know.
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// First frame on every connection. Binds the channel to one area.
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        /// Bearer credential.
        token: String,
        /// Team of the area.
        team_id: String,
        /// Area to subscribe to.
        area_id: String,
        /// The authenticated user.
        user_id: String,
    },
    /// Heartbeat probe.
    #[serde(rename = "ping")]
    Ping,
    /// Local user typing indicator.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        /// `true` while typing, `false` once stopped.
        is_typing: bool,
    },
}

/// Why the server refused a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorCode {
    /// Credential missing, expired or unknown.
    Unauthorized,
    /// The team/area pair does not exist.
    AreaNotFound,
    /// The user may not join this area.
    Forbidden,
    /// Any code this client does not know. Still a refusal.
    #[serde(other)]
    Other,
}

impl std::fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::AreaNotFound => "area_not_found",
            Self::Forbidden => "forbidden",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Control replies sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Handshake accepted.
    #[serde(rename = "auth:ok", rename_all = "camelCase")]
    AuthOk {
        /// Server-side session identifier, for logging.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Handshake refused. The connection is closed after this frame.
    #[serde(rename = "auth:error")]
    AuthError {
        /// Machine-readable reason.
        code: AuthErrorCode,
        /// Human-readable reason.
        #[serde(default)]
        reason: String,
    },
    /// Heartbeat reply.
    #[serde(rename = "pong")]
    Pong,
}

const CONTROL_TAGS: [&str; 3] = ["auth:ok", "auth:error", "pong"];

/// Anything the server can put on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Handshake or heartbeat reply.
    Control(ControlFrame),
    /// Area event.
    Event(InboundEvent),
}

impl From<ControlFrame> for ServerFrame {
    fn from(frame: ControlFrame) -> Self {
        Self::Control(frame)
    }
}

impl From<InboundEvent> for ServerFrame {
    fn from(event: InboundEvent) -> Self {
        Self::Event(event)
    }
}

/// Encodes a [`ClientFrame`] as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ClientFrame`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError` if the text is oversized or not a valid client frame.
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ServerFrame`] as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a server frame, dispatching on its `type` tag.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` for non-object or untagged input,
/// `CodecError::UnknownType` for an unrecognised tag, and
/// `CodecError::Serialization` when a known frame has the wrong shape.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, CodecError> {
    check_size(text)?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CodecError::InvalidFrame("missing type tag".to_string()))?
        .to_string();

    if CONTROL_TAGS.contains(&tag.as_str()) {
        return serde_json::from_value(value)
            .map(ServerFrame::Control)
            .map_err(|e| CodecError::Serialization(e.to_string()));
    }
    if tag.starts_with("message:") || tag.starts_with("typing:") {
        return match serde_json::from_value::<InboundEvent>(value) {
            Ok(event) => Ok(ServerFrame::Event(event)),
            Err(e) if e.to_string().contains("unknown variant") => {
                Err(CodecError::UnknownType(tag))
            }
            Err(e) => Err(CodecError::Serialization(e.to_string())),
        };
    }
    Err(CodecError::UnknownType(tag))
}

fn check_size(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrame(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_SIZE}",
            text.len()
        )));
    }
    Ok(())
}
