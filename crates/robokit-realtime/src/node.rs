//! Bridges the streaming session onto the message bus.
//!
//! [`RealtimeNode`] hosts a [`ConnectionManager`] inside the node runtime so
//! the session gets supervision, heartbeats, and lifecycle handling for free.
//! Traffic flows both ways:
//!
//! - every inbound event (including the synthetic `connection.*` ones) is
//!   republished on the `realtime_event` topic;
//! - `voice_command` messages become conversation items plus a response
//!   request;
//! - `audio_chunk` messages become input-audio-buffer appends and commits.
//!
//! When the session fails terminally the node raises a `system_alert` and
//! returns an error from its main loop, handing the decision to restart to
//! the supervisor's policy.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use robokit_bus::MessageBus;
use robokit_node::Node;
use robokit_types::{Message, RealtimeConfig, RobotError, topics};

use crate::events::ClientEvent;
use crate::manager::ConnectionManager;

pub struct RealtimeNode {
    name: String,
    config: RealtimeConfig,
    bus: MessageBus,
    session: Option<Value>,
    manager: Option<Arc<ConnectionManager>>,
    alert_sent: bool,
}

impl RealtimeNode {
    pub fn new(name: &str, config: RealtimeConfig, bus: MessageBus) -> Self {
        Self {
            name: name.to_string(),
            config,
            bus,
            session: None,
            manager: None,
            alert_sent: false,
        }
    }

    /// Session parameters to push (as a `session.update`) once connected.
    pub fn with_session(mut self, session: Value) -> Self {
        self.session = Some(session);
        self
    }

    /// The underlying manager, available between `initialize` and `cleanup`.
    pub fn manager(&self) -> Option<&Arc<ConnectionManager>> {
        self.manager.as_ref()
    }

    fn wire_bus(&self, manager: &Arc<ConnectionManager>) -> Result<(), RobotError> {
        // Inbound: everything the endpoint says goes out on the bus.
        let bus = self.bus.clone();
        let source = self.name.clone();
        manager.on_any(Arc::new(move |event: &crate::events::ServerEvent| {
            let payload = event.raw.as_object().cloned().unwrap_or_default();
            if let Err(error) = bus.publish(&source, topics::REALTIME_EVENT, payload) {
                warn!(%error, "failed to republish realtime event");
            }
        }));

        // Outbound: spoken-command text becomes a user turn plus a response
        // request.
        let voice_manager = Arc::clone(manager);
        self.bus.subscribe(
            &self.name,
            topics::VOICE_COMMAND,
            Arc::new(move |message: &Message| {
                let Some(text) = message.payload.get("text").and_then(Value::as_str) else {
                    warn!(source = %message.source_node, "voice_command without text field");
                    return;
                };
                if voice_manager.send_sync(&ClientEvent::user_text(text)) {
                    voice_manager.send_sync(&ClientEvent::ResponseCreate { response: None });
                } else {
                    warn!("voice command dropped; session unavailable");
                }
            }),
        )?;

        // Outbound: microphone audio.
        let audio_manager = Arc::clone(manager);
        self.bus.subscribe(
            &self.name,
            topics::AUDIO_CHUNK,
            Arc::new(move |message: &Message| {
                if let Some(audio) = message.payload.get("audio").and_then(Value::as_str) {
                    audio_manager.send_sync(&ClientEvent::InputAudioBufferAppend {
                        audio: audio.to_string(),
                    });
                }
                let commit = message
                    .payload
                    .get("commit")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if commit {
                    audio_manager.send_sync(&ClientEvent::InputAudioBufferCommit {});
                }
            }),
        )?;
        Ok(())
    }
}

impl Node for RealtimeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), RobotError> {
        let manager = Arc::new(ConnectionManager::new(self.config.clone())?);
        self.wire_bus(&manager)?;
        manager.start()?;
        if let Some(session) = &self.session {
            manager.send_sync(&ClientEvent::SessionUpdate {
                session: session.clone(),
            });
        }
        info!(node = %self.name, url = %self.config.url, "realtime session starting");
        self.manager = Some(manager);
        Ok(())
    }

    fn main_loop(&mut self) -> Result<(), RobotError> {
        let Some(manager) = &self.manager else {
            return Ok(());
        };
        if manager.is_terminal() && !self.alert_sent {
            self.alert_sent = true;
            let error = RobotError::Terminal {
                attempts: self.config.max_reconnect_attempts,
            };
            let mut payload = robokit_types::Payload::new();
            payload.insert("node".to_string(), Value::String(self.name.clone()));
            payload.insert("error".to_string(), Value::String(error.to_string()));
            if let Err(publish_error) =
                self.bus.publish(&self.name, topics::SYSTEM_ALERT, payload)
            {
                warn!(error = %publish_error, "failed to publish system alert");
            }
            return Err(RobotError::Node {
                node: self.name.clone(),
                details: error.to_string(),
            });
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.destroy();
        }
    }
}
