//! `robokit-types` – Shared Vocabulary
//!
//! Pure data: the message envelope exchanged over the in-process bus, the
//! canonical topic registry, the heartbeat payload published by every node,
//! the framework-wide error type, and the configuration surface consumed
//! from external launchers.
//!
//! # Modules
//!
//! - [`config`] – [`RealtimeConfig`][config::RealtimeConfig],
//!   [`NodeConfig`][config::NodeConfig] and
//!   [`SupervisorConfig`][config::SupervisorConfig]: serde-deserializable
//!   settings bundles handed to the core by whatever loads configuration.
//! - [`topics`] – canonical topic names plus [`topics::validate_topic`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod config;

pub use config::{NodeConfig, RealtimeConfig, SupervisorConfig};

/// Ordered string-to-value mapping carried by every [`Message`].
///
/// `serde_json`'s map type is built with the `preserve_order` feature, so a
/// payload keeps the insertion order chosen by the publisher.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Topic registry
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical topic names used across the framework.
///
/// Topics are created lazily on the bus by either the first publisher or the
/// first subscriber, so nothing here needs pre-registration; the constants
/// exist so call sites agree on spelling.
pub mod topics {
    use crate::RobotError;

    /// Periodic per-node liveness signal carrying a [`HeartbeatData`](crate::HeartbeatData) payload.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Recognised speech turned into text by the speech pipeline.
    pub const VOICE_COMMAND: &str = "voice_command";
    /// Text/audio turn boundaries emitted while the robot is speaking.
    pub const SPEECH_EVENT: &str = "speech_event";
    /// Base64-encoded microphone audio destined for the streaming session.
    pub const AUDIO_CHUNK: &str = "audio_chunk";
    /// Every inbound frame from the streaming API, relayed verbatim.
    pub const REALTIME_EVENT: &str = "realtime_event";
    /// Faults that need an operator's or supervisor's attention.
    pub const SYSTEM_ALERT: &str = "system_alert";
    /// Node start/stop/error notifications from the runtime.
    pub const NODE_LIFECYCLE: &str = "node_lifecycle";

    /// Reject topic names that cannot be routed.
    ///
    /// A topic must be non-empty and free of whitespace.  Publishing or
    /// subscribing with a malformed topic fails fast instead of silently
    /// creating an unreachable channel.
    pub fn validate_topic(topic: &str) -> Result<(), RobotError> {
        if topic.is_empty() {
            return Err(RobotError::Validation("topic must not be empty".to_string()));
        }
        if topic.chars().any(char::is_whitespace) {
            return Err(RobotError::Validation(format!(
                "topic '{topic}' must not contain whitespace"
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Envelope for every message routed over the in-process bus.
///
/// Immutable once published: the bus hands each subscriber a shared reference
/// and no subscriber may alter what the next one sees.  Messages live only as
/// long as the dispatch that carries them; nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Topic this message was published on.
    pub topic: String,
    /// Ordered key/value payload chosen by the publisher.
    pub payload: Payload,
    /// Wall-clock publish time.
    pub timestamp: DateTime<Utc>,
    /// Name of the node that published the message.
    pub source_node: String,
    /// Unique id, e.g. for correlating log lines across subscribers.
    pub message_id: Uuid,
}

impl Message {
    /// Build a fresh envelope around `payload`, stamping it with the current
    /// time and a new v4 id.
    pub fn new(source_node: impl Into<String>, topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            source_node: source_node.into(),
            message_id: Uuid::new_v4(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat payload
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness sample published by every node on [`topics::HEARTBEAT`].
///
/// The external health monitor compares `node_name` timestamps against its
/// deadline table; `cpu_percent`/`memory_kb` are best-effort process samples
/// (zero on platforms without `/proc`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub node_name: String,
    /// Current lifecycle state, e.g. `"running"`.
    pub status: String,
    pub cpu_percent: f32,
    pub memory_kb: u64,
    /// Seconds since the node's thread entered its run loop.
    pub uptime_s: f64,
}

impl HeartbeatData {
    /// Convert into a bus [`Payload`].
    ///
    /// Serialising a struct with only primitive fields cannot fail, so the
    /// fallback empty map is unreachable in practice.
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Framework-wide error type spanning validation, bus, connection, and node
/// lifecycle failures.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RobotError {
    /// Malformed input rejected synchronously at the API boundary.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bus-internal failure (e.g. a poisoned subscriber registry).
    #[error("Bus error: {0}")]
    Bus(String),

    /// Transient connection failure; the connection manager retries these.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Reconnection attempts exhausted; the session will not recover.
    #[error("Connection terminally failed after {attempts} reconnect attempts")]
    Terminal { attempts: u32 },

    /// A node's `initialize` or `main_loop` failed.
    #[error("Node '{node}' failed: {details}")]
    Node { node: String, details: String },

    /// Missing or invalid configuration, caught at construction time.
    #[error("Configuration error: {0}")]
    Config(String),
}
