//! Thread-safe, topic-based publish/subscribe message bus.
//!
//! Dispatch is synchronous: `publish` invokes every subscriber's handler
//! sequentially on the publishing thread, so messages published to one topic
//! from one thread arrive at each subscriber in publish order with no queuing
//! or buffering in between.  The subscriber registry is consulted inside a
//! short read-lock critical section; handlers run strictly outside any
//! bus-held lock, so a handler that itself publishes cannot deadlock the bus.
//!
//! # Delivery guarantees
//!
//! | Property | Guarantee |
//! |---|---|
//! | Same publisher thread, same topic | In publish order |
//! | Across publisher threads or topics | None |
//! | Subscriber panic | Caught, logged, siblings still delivered |
//! | Zero subscribers | Silent no-op, `Ok(0)` |
//! | Unsubscribe vs in-flight dispatch | At most one extra delivery |

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use robokit_types::topics::validate_topic;
use robokit_types::{Message, Payload, RobotError};
use tracing::error;

// ─────────────────────────────────────────────────────────────────────────────
// Handler trait
// ─────────────────────────────────────────────────────────────────────────────

/// A typed subscriber: one method, one message at a time.
///
/// Implemented automatically for any `Fn(&Message) + Send + Sync` closure, so
/// both handler objects and plain closures can subscribe.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageBus
// ─────────────────────────────────────────────────────────────────────────────

struct Registration {
    node_id: String,
    handler: Arc<dyn MessageHandler>,
}

/// Shared message bus.  Clone it cheaply – all clones share the same
/// underlying subscriber registry.
#[derive(Clone, Default)]
pub struct MessageBus {
    registry: Arc<RwLock<HashMap<String, Vec<Registration>>>>,
}

impl MessageBus {
    /// Create a bus with an empty topic registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` on `topic`, delivering to every current subscriber.
    ///
    /// Returns the number of handlers that completed normally.  `Ok(0)` when
    /// the topic has no subscribers – that is a normal condition, not an
    /// error.  A panicking handler is caught and logged; delivery to the
    /// remaining subscribers continues and the publisher never sees the
    /// panic.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] for a malformed topic and
    /// [`RobotError::Bus`] if the registry lock is poisoned.
    pub fn publish(
        &self,
        source_node: &str,
        topic: &str,
        payload: Payload,
    ) -> Result<usize, RobotError> {
        validate_topic(topic)?;
        let message = Message::new(source_node, topic, payload);

        // Snapshot the subscriber list under the read lock, then release it
        // before any handler runs.  An unsubscribe racing with this snapshot
        // can cause at most one extra delivery to the removed handler.
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = {
            let registry = self
                .registry
                .read()
                .map_err(|_| RobotError::Bus("subscriber registry poisoned".to_string()))?;
            match registry.get(topic) {
                Some(list) => list
                    .iter()
                    .map(|r| (r.node_id.clone(), Arc::clone(&r.handler)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for (node_id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&message))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    error!(topic, subscriber = %node_id, "subscriber handler panicked; continuing delivery");
                }
            }
        }
        Ok(delivered)
    }

    /// Register `handler` for `topic` on behalf of `node_id`.
    ///
    /// Idempotent per `(node_id, topic)`: subscribing again replaces the
    /// previous handler instead of adding a duplicate.  The topic entry is
    /// created lazily if this is its first subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] for a malformed topic.
    pub fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RobotError> {
        validate_topic(topic)?;
        let mut registry = self
            .registry
            .write()
            .map_err(|_| RobotError::Bus("subscriber registry poisoned".to_string()))?;
        let list = registry.entry(topic.to_string()).or_default();
        if let Some(existing) = list.iter_mut().find(|r| r.node_id == node_id) {
            existing.handler = handler;
        } else {
            list.push(Registration {
                node_id: node_id.to_string(),
                handler,
            });
        }
        Ok(())
    }

    /// Remove `node_id`'s registration on `topic`.
    ///
    /// A `publish` that snapshotted the subscriber list before this call
    /// completes its delivery to the removed handler; that single extra
    /// delivery is accepted rather than eliminated.  Unsubscribing a node
    /// that was never subscribed is a no-op.
    pub fn unsubscribe(&self, node_id: &str, topic: &str) {
        if let Ok(mut registry) = self.registry.write()
            && let Some(list) = registry.get_mut(topic)
        {
            list.retain(|r| r.node_id != node_id);
        }
    }

    /// Remove every registration held by `node_id`, across all topics.
    ///
    /// Called by the node runtime during teardown so a dead node leaves no
    /// dangling handlers behind.
    pub fn unsubscribe_all(&self, node_id: &str) {
        if let Ok(mut registry) = self.registry.write() {
            for list in registry.values_mut() {
                list.retain(|r| r.node_id != node_id);
            }
        }
    }

    /// Number of subscribers currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .read()
            .map(|registry| registry.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Names of every topic the bus has seen so far, in no particular order.
    pub fn topic_names(&self) -> Vec<String> {
        self.registry
            .read()
            .map(|registry| registry.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robokit_types::topics;
    use serde_json::json;
    use std::sync::Mutex;

    fn payload_with(entries: &[(&str, serde_json::Value)]) -> Payload {
        let mut payload = Payload::new();
        for (key, value) in entries {
            payload.insert((*key).to_string(), value.clone());
        }
        payload
    }

    /// Collects every message a subscriber sees, for assertion.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: &Message) {
            self.seen.lock().unwrap().push(message.clone());
        }
    }

    #[test]
    fn publish_delivers_payload_to_subscriber() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("listener", topics::VOICE_COMMAND, recorder.clone())
            .unwrap();

        let payload = payload_with(&[("text", json!("hello")), ("confidence", json!(0.9))]);
        let delivered = bus
            .publish("speech_node", topics::VOICE_COMMAND, payload.clone())
            .unwrap();

        assert_eq!(delivered, 1);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, payload);
        assert_eq!(seen[0].source_node, "speech_node");
    }

    #[test]
    fn two_subscribers_each_receive_exactly_once_in_order() {
        let bus = MessageBus::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        bus.subscribe("gesture_node", "voice_command", first.clone())
            .unwrap();
        bus.subscribe("display_node", "voice_command", second.clone())
            .unwrap();

        let payload = payload_with(&[("text", json!("hello")), ("confidence", json!(0.9))]);
        bus.publish("speech_node", "voice_command", payload.clone())
            .unwrap();

        for recorder in [&first, &second] {
            let seen = recorder.seen.lock().unwrap();
            assert_eq!(seen.len(), 1, "exactly one delivery per subscriber");
            assert_eq!(seen[0].payload, payload);
        }
    }

    #[test]
    fn publish_order_preserved_for_single_publisher() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("listener", "telemetry", recorder.clone())
            .unwrap();

        for i in 0..10 {
            bus.publish("sensor", "telemetry", payload_with(&[("seq", json!(i))]))
                .unwrap();
        }

        let seen = recorder.seen.lock().unwrap();
        let sequence: Vec<i64> = seen
            .iter()
            .map(|m| m.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(sequence, (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn publish_without_subscribers_is_silent_success() {
        let bus = MessageBus::new();
        let delivered = bus
            .publish("sensor", "nobody_listens", Payload::new())
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn malformed_topic_fails_fast() {
        let bus = MessageBus::new();
        assert!(matches!(
            bus.publish("sensor", "", Payload::new()),
            Err(RobotError::Validation(_))
        ));
        assert!(matches!(
            bus.subscribe("n", "bad topic", Arc::new(Recorder::default())),
            Err(RobotError::Validation(_))
        ));
    }

    #[test]
    fn panicking_subscriber_does_not_abort_delivery() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(
            "faulty",
            "alerts",
            Arc::new(|_msg: &Message| panic!("handler bug")),
        )
        .unwrap();
        bus.subscribe("healthy", "alerts", recorder.clone()).unwrap();

        let delivered = bus.publish("monitor", "alerts", Payload::new()).unwrap();

        // Only the healthy handler counts as delivered; the publisher never
        // sees the panic.
        assert_eq!(delivered, 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_future_deliveries() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("listener", "telemetry", recorder.clone())
            .unwrap();
        bus.publish("sensor", "telemetry", Payload::new()).unwrap();

        bus.unsubscribe("listener", "telemetry");
        bus.publish("sensor", "telemetry", Payload::new()).unwrap();

        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count("telemetry"), 0);
    }

    #[test]
    fn resubscribe_replaces_handler_instead_of_duplicating() {
        let bus = MessageBus::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        bus.subscribe("listener", "telemetry", first.clone()).unwrap();
        bus.subscribe("listener", "telemetry", second.clone()).unwrap();

        bus.publish("sensor", "telemetry", Payload::new()).unwrap();

        assert_eq!(bus.subscriber_count("telemetry"), 1);
        assert_eq!(first.seen.lock().unwrap().len(), 0, "replaced handler");
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_all_clears_every_topic() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("node_a", "telemetry", recorder.clone()).unwrap();
        bus.subscribe("node_a", "alerts", recorder.clone()).unwrap();
        bus.subscribe("node_b", "alerts", recorder.clone()).unwrap();

        bus.unsubscribe_all("node_a");

        assert_eq!(bus.subscriber_count("telemetry"), 0);
        assert_eq!(bus.subscriber_count("alerts"), 1);
    }

    #[test]
    fn topics_are_isolated() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("listener", "alerts", recorder.clone()).unwrap();

        bus.publish("sensor", "telemetry", Payload::new()).unwrap();

        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_may_publish_without_deadlock() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("chained", "output", recorder.clone()).unwrap();

        let inner_bus = bus.clone();
        bus.subscribe(
            "relay",
            "input",
            Arc::new(move |_msg: &Message| {
                // Re-publishing from inside a handler must not deadlock: the
                // registry lock is released before handlers run.
                let _ = inner_bus.publish("relay", "output", Payload::new());
            }),
        )
        .unwrap();

        bus.publish("sensor", "input", Payload::new()).unwrap();
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn closure_subscribers_work() {
        let bus = MessageBus::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe(
            "counter",
            "telemetry",
            Arc::new(move |_msg: &Message| {
                *count_clone.lock().unwrap() += 1;
            }),
        )
        .unwrap();

        bus.publish("sensor", "telemetry", Payload::new()).unwrap();
        bus.publish("sensor", "telemetry", Payload::new()).unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
