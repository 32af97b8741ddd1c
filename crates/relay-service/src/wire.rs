//! JSON wire format for the relay protocol.
//!
//! Inbound frames carry a `type` discriminator:
//!
//! ```text
//! {"type":"register","id":"alice","interests":["rust","go"]}
//! {"type":"message","text":"hello"}
//! ```
//!
//! Decoding is lenient the same way the deployed clients expect: absent
//! fields (or explicit `null`) default to empty. A frame that is not a JSON
//! object, or whose fields have the wrong JSON type, is a decode failure.
//! An unrecognized `type` decodes to [`InboundEvent::Unknown`] so the
//! connection can ignore it and stay open.

use crate::errors::RelayError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Declare identity and interests.
    Register {
        identity: String,
        interests: BTreeSet<String>,
    },
    /// Text for the current partner. The raw frame is what gets relayed;
    /// `text` is only read for its length in logs.
    Message { text: String },
    /// Any other `type` value (including a missing one).
    Unknown { kind: String },
}

/// Shape of every inbound frame before dispatch on `type`.
#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    interests: Option<Vec<String>>,
}

/// Decode one inbound text frame.
pub fn decode_inbound(raw: &str) -> Result<InboundEvent, RelayError> {
    let msg: RawClientMessage =
        serde_json::from_str(raw).map_err(|e| RelayError::Decode(e.to_string()))?;

    let kind = msg.kind.unwrap_or_default();
    let event = match kind.as_str() {
        "register" => InboundEvent::Register {
            identity: msg.id.unwrap_or_default(),
            interests: msg.interests.unwrap_or_default().into_iter().collect(),
        },
        "message" => InboundEvent::Message {
            text: msg.text.unwrap_or_default(),
        },
        _ => InboundEvent::Unknown { kind },
    };

    Ok(event)
}

/// An event routed to one connection for delivery to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// The session was paired; carries the partner's identity.
    Matched { partner: String },
    /// A partner's `message` frame, forwarded byte-for-byte.
    Relay { payload: String },
    /// A rejected request.
    Error { code: i32, message: String },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Match { id: &'a str },
    Error { code: i32, message: &'a str },
}

impl OutboundEvent {
    /// Build an error event from a relay error (client-safe text only).
    #[must_use]
    pub fn from_error(err: &RelayError) -> Self {
        OutboundEvent::Error {
            code: err.error_code(),
            message: err.client_message(),
        }
    }

    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Matched { .. } => "match",
            OutboundEvent::Relay { .. } => "message",
            OutboundEvent::Error { .. } => "error",
        }
    }

    /// Encode into the text frame sent to the client.
    pub fn encode(&self) -> Result<String, RelayError> {
        let frame = match self {
            OutboundEvent::Relay { payload } => return Ok(payload.clone()),
            OutboundEvent::Matched { partner } => ServerMessage::Match { id: partner },
            OutboundEvent::Error { code, message } => ServerMessage::Error {
                code: *code,
                message,
            },
        };
        serde_json::to_string(&frame).map_err(|e| RelayError::Internal(e.to_string()))
    }
}
