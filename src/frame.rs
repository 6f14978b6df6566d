//! Wire frames exchanged over the chat transport.
//!
//! Every frame is a JSON text message `{"type": "...", "body": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// ── Frame types ──────────────────────────────────────────────────────────────

pub const CHAT_MESSAGE: &str = "chat_message";
pub const TYPING:       &str = "typing";
pub const RATE_LIMIT:   &str = "rate_limit";
pub const CONNECTED:    &str = "connected";
pub const DISCONNECTED: &str = "disconnected";
pub const ERROR:        &str = "error";
pub const PING:         &str = "ping";
pub const PONG:         &str = "pong";
pub const ACK:          &str = "ack";

/// One discrete typed message unit. Inbound frames are dispatched as-is, so
/// this doubles as the inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_body")]
    pub body: Value,
}

pub type InboundEnvelope = Frame;

fn empty_body() -> Value {
    Value::Object(Default::default())
}

impl Frame {
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Frame { kind: kind.into(), body }
    }

    /// Build a frame from any serialisable body.
    pub fn with_body<T: Serialize>(kind: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Frame { kind: kind.into(), body: serde_json::to_value(body)? })
    }

    pub fn ping() -> Self { Frame::new(PING, empty_body()) }

    pub fn pong() -> Self { Frame::new(PONG, empty_body()) }

    /// Deserialize the body into a typed struct.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(T::deserialize(&self.body)?)
    }
}

pub fn decode_frame(raw: &str) -> Result<Frame> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_frame(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

// ── Bodies ───────────────────────────────────────────────────────────────────

/// Outbound `chat_message` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingChat {
    pub id:   String,
    pub text: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Inbound `chat_message` body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingChat {
    pub id:        String,
    pub sender_id: String,
    pub text:      String,
    #[serde(default)]
    pub mode: Option<String>,
    /// Set for team direct messages; absent for team-wide broadcasts.
    #[serde(default)]
    pub recipient_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitBody {
    pub exceeded: bool,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AckBody {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectedBody {
    #[serde(default)]
    pub user_id: Option<String>,
}
