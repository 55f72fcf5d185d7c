//! Wire frames and their JSON codec
//!
//! Inbound bytes are decoded into a fixed set of frame variants at the
//! transport boundary. Anything that does not match a known variant becomes
//! [`InboundFrame::Unrecognized`] instead of an error, so the caller can drop
//! it and keep the connection open.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Side};

/// Frames pushed from the relay to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full log snapshot, sent once right after a connection attaches
    Init { messages: Vec<Message> },
    /// One newly appended message, sent to every attached connection
    NewMessage { message: Message },
}

impl ServerFrame {
    #[must_use]
    pub const fn frame_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::NewMessage { .. } => "new_message",
        }
    }
}

/// Frames received from clients, after decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Request to post a chat message
    Chat { sender: Side, text: String },
    /// Invalid JSON, unknown `type`, or missing/invalid fields
    Unrecognized { reason: String },
}

/// Known client frame shapes as they appear on the wire
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientWireFrame {
    Message { sender: Side, text: String },
}

/// Decode one inbound text payload. Never fails.
#[must_use]
pub fn decode_inbound(payload: &str) -> InboundFrame {
    match serde_json::from_str::<ClientWireFrame>(payload) {
        Ok(ClientWireFrame::Message { sender, text }) => InboundFrame::Chat { sender, text },
        Err(e) => InboundFrame::Unrecognized {
            reason: e.to_string(),
        },
    }
}

/// Decode one inbound binary payload. Non-UTF-8 payloads are unrecognized.
#[must_use]
pub fn decode_inbound_bytes(payload: &[u8]) -> InboundFrame {
    match std::str::from_utf8(payload) {
        Ok(text) => decode_inbound(text),
        Err(e) => InboundFrame::Unrecognized {
            reason: format!("binary payload is not UTF-8: {e}"),
        },
    }
}

/// Serialize a server frame to its JSON text form
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
