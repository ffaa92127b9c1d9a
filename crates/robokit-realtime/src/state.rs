//! Connection state machine.
//!
//! ```text
//! Disconnected ──start()──▶ Connecting ──handshake ok──▶ Connected
//! Connected ──socket closed/error──▶ Reconnecting
//! Reconnecting ──backoff elapsed──▶ Connecting
//! Reconnecting ──attempts exhausted──▶ Disconnected   (terminal failure)
//! any non-terminal ──stop()/destroy()──▶ Closed       (terminal)
//! ```
//!
//! Transitions are computed by the pure function [`next_state`] and applied
//! by the single control loop in [`manager`](crate::manager); the loop never
//! hand-writes a state change, so the set of reachable states is exactly what
//! this table allows.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.  Before `start()` this is the idle state; after the
    /// retry budget is exhausted it is the terminal-failure state.
    Disconnected,
    /// TCP + WebSocket handshake in flight.
    Connecting,
    /// Session established; frames flow.
    Connected,
    /// Waiting out a backoff delay before the next connect attempt.
    Reconnecting,
    /// Torn down by `stop()`/`destroy()`.  Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Closed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Closed => 4,
        }
    }
}

/// Input that may cause a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `start()` was called.
    Start,
    /// WebSocket handshake completed.
    HandshakeOk,
    /// The socket closed or errored, or a connect attempt failed.
    SocketLost,
    /// The backoff delay for the current attempt has elapsed.
    BackoffElapsed,
    /// Consecutive failures exceeded the configured retry budget.
    AttemptsExhausted,
    /// `stop()`/`destroy()` was called.
    StopRequested,
}

/// The transition table.  Inputs that are meaningless in the current state
/// leave it unchanged, so the loop can apply triggers unconditionally.
pub fn next_state(state: ConnectionState, trigger: Trigger) -> ConnectionState {
    use ConnectionState::*;
    use Trigger::*;
    match (state, trigger) {
        (Disconnected, Start) => Connecting,
        (Connecting, HandshakeOk) => Connected,
        (Connecting, SocketLost) => Reconnecting,
        (Connected, SocketLost) => Reconnecting,
        (Reconnecting, BackoffElapsed) => Connecting,
        (Reconnecting, AttemptsExhausted) => Disconnected,
        (Connecting, AttemptsExhausted) => Disconnected,
        (Closed, _) => Closed,
        (current, StopRequested) => {
            let _ = current;
            Closed
        }
        (current, _) => current,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic cell
// ─────────────────────────────────────────────────────────────────────────────

/// Lock-free cell holding a [`ConnectionState`].
///
/// Written only by the loop thread; read by any caller through
/// `ConnectionManager::get_state`.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected.to_u8()))
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `trigger` via [`next_state`], returning the state that results.
    pub fn apply(&self, trigger: Trigger) -> ConnectionState {
        let next = next_state(self.get(), trigger);
        self.0.store(next.to_u8(), Ordering::Release);
        next
    }

    /// Force `Closed` (used by `destroy()` when the loop is already gone).
    pub fn close(&self) {
        self.0.store(ConnectionState::Closed.to_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::Trigger::*;
    use super::*;

    #[test]
    fn happy_path() {
        assert_eq!(next_state(Disconnected, Start), Connecting);
        assert_eq!(next_state(Connecting, HandshakeOk), Connected);
    }

    #[test]
    fn drop_and_recover() {
        assert_eq!(next_state(Connected, SocketLost), Reconnecting);
        assert_eq!(next_state(Reconnecting, BackoffElapsed), Connecting);
        assert_eq!(next_state(Connecting, HandshakeOk), Connected);
    }

    #[test]
    fn exhaustion_is_terminal_failure() {
        assert_eq!(next_state(Reconnecting, AttemptsExhausted), Disconnected);
        assert_eq!(next_state(Connecting, AttemptsExhausted), Disconnected);
    }

    #[test]
    fn stop_wins_from_every_live_state() {
        for state in [Disconnected, Connecting, Connected, Reconnecting] {
            assert_eq!(next_state(state, StopRequested), Closed);
        }
    }

    #[test]
    fn closed_is_absorbing() {
        for trigger in [Start, HandshakeOk, SocketLost, BackoffElapsed, StopRequested] {
            assert_eq!(next_state(Closed, trigger), Closed);
        }
    }

    #[test]
    fn irrelevant_triggers_are_no_ops() {
        assert_eq!(next_state(Connected, Start), Connected);
        assert_eq!(next_state(Disconnected, SocketLost), Disconnected);
        assert_eq!(next_state(Connecting, BackoffElapsed), Connecting);
    }

    #[test]
    fn cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), Disconnected);
        assert_eq!(cell.apply(Start), Connecting);
        assert_eq!(cell.apply(HandshakeOk), Connected);
        cell.close();
        assert_eq!(cell.get(), Closed);
    }
}
