//! Session counters.
//!
//! Cheap enough to record on every frame; read through point-in-time
//! [`ConnectionMetrics`] snapshots so callers never hold the lock across
//! their own work.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Point-in-time view of session health.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionMetrics {
    /// Frames successfully written to the socket.
    pub messages_sent: u64,
    /// Text frames received and decoded.
    pub messages_received: u64,
    /// Handshakes attempted, successful or not (includes the first connect).
    pub connection_attempts: u64,
    /// Connect attempts made after losing an established session.
    pub reconnect_attempts: u64,
    /// Seconds spent in the `Connected` state, across all sessions so far.
    pub uptime_s: f64,
}

#[derive(Default)]
struct Counters {
    messages_sent: u64,
    messages_received: u64,
    connection_attempts: u64,
    reconnect_attempts: u64,
    connected_since: Option<Instant>,
    accumulated_uptime_s: f64,
}

/// Interior-mutable counter cell shared between the loop thread and readers.
#[derive(Default)]
pub(crate) struct MetricsCell {
    inner: Mutex<Counters>,
}

impl MetricsCell {
    fn with<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> Option<R> {
        self.inner.lock().ok().map(|mut counters| f(&mut counters))
    }

    pub fn record_sent(&self) {
        self.with(|c| c.messages_sent += 1);
    }

    pub fn record_received(&self) {
        self.with(|c| c.messages_received += 1);
    }

    pub fn record_attempt(&self, is_reconnect: bool) {
        self.with(|c| {
            c.connection_attempts += 1;
            if is_reconnect {
                c.reconnect_attempts += 1;
            }
        });
    }

    pub fn mark_connected(&self) {
        self.with(|c| c.connected_since = Some(Instant::now()));
    }

    /// Fold the current session's uptime into the running total.
    pub fn mark_disconnected(&self) {
        self.with(|c| {
            if let Some(since) = c.connected_since.take() {
                c.accumulated_uptime_s += since.elapsed().as_secs_f64();
            }
        });
    }

    pub fn snapshot(&self) -> ConnectionMetrics {
        self.with(|c| {
            let live = c
                .connected_since
                .map(|since| since.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            ConnectionMetrics {
                messages_sent: c.messages_sent,
                messages_received: c.messages_received,
                connection_attempts: c.connection_attempts,
                reconnect_attempts: c.reconnect_attempts,
                uptime_s: c.accumulated_uptime_s + live,
            }
        })
        .unwrap_or(ConnectionMetrics {
            messages_sent: 0,
            messages_received: 0,
            connection_attempts: 0,
            reconnect_attempts: 0,
            uptime_s: 0.0,
        })
    }
}
