//! The `{"type": ...}` wire envelope.
//!
//! Everything crossing the WebSocket is a JSON text frame whose only
//! structural requirement is a string `type` discriminator.  Outbound frames
//! are the small set of control messages this system produces, modelled as a
//! tagged enum; inbound frames are kept as the raw object next to their
//! decoded type so handlers and the bus relay see exactly what the endpoint
//! sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use robokit_types::RobotError;

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic connection events
// ─────────────────────────────────────────────────────────────────────────────

/// Event types injected by the connection loop itself (never received from
/// the wire) so subscribers can observe connection health.
pub mod synthetic {
    /// The socket dropped; a reconnect cycle is beginning.
    pub const RECONNECTING: &str = "connection.reconnecting";
    /// A connect attempt failed; the session is still retrying.
    pub const DISCONNECTED: &str = "connection.disconnected";
    /// Retry budget exhausted; the session will not recover.
    pub const FATAL: &str = "connection.fatal";
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Control messages this system sends to the streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session-level parameters (voice, modalities, transcription…).
    #[serde(rename = "session.update")]
    SessionUpdate { session: Value },

    /// Insert an item (typically a user text turn) into the conversation.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: Value },

    /// Ask the endpoint to generate a response to the conversation so far.
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },

    /// Append a base64 audio chunk to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Commit the buffered audio as a completed user turn.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {},
}

impl ClientEvent {
    /// The wire `type` string for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit {} => "input_audio_buffer.commit",
        }
    }

    /// Serialise to the JSON text frame sent over the socket.
    pub fn to_frame(&self) -> Result<String, RobotError> {
        serde_json::to_string(self).map_err(|e| RobotError::Validation(e.to_string()))
    }

    /// Convenience builder: a user text turn.
    pub fn user_text(text: &str) -> Self {
        ClientEvent::ConversationItemCreate {
            item: serde_json::json!({
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded inbound frame: the `type` discriminator plus the untouched
/// object it came from.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub raw: Value,
}

impl ServerEvent {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] when the frame is not a JSON
    /// object or carries no string `type` field.
    pub fn parse(text: &str) -> Result<Self, RobotError> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| RobotError::Validation(format!("bad frame: {e}")))?;
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RobotError::Validation("frame has no string 'type'".to_string()))?
            .to_string();
        Ok(Self { event_type, raw })
    }

    /// Build a loop-injected connection event (see [`synthetic`]).
    pub fn synthetic(event_type: &str, detail: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            raw: serde_json::json!({ "type": event_type, "detail": detail }),
        }
    }
}
