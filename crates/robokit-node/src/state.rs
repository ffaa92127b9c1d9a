//! Node lifecycle state machine.
//!
//! Legal transitions:
//!
//! ```text
//! Created → Initializing → Running → Stopping → Stopped
//!               │              │
//!               └──→ Error ←───┘
//!                      │
//!                      └──→ Stopping
//! ```
//!
//! State is mutated only by the node's own thread; the one externally
//! writable input is the stop request flag, which asks the thread to take the
//! `Running → Stopping` edge itself.  A supervised restart never reuses a
//! state cell – it re-creates a fresh node starting at `Created`.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl NodeState {
    /// `true` if the edge `self → next` is in the legal transition graph.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Running)
                | (Initializing, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Stopping)
        )
    }

    /// `true` once the node can never run again (`Stopped`).
    ///
    /// `Error` is not terminal: the supervisor may drive it through
    /// `Stopping` and re-create the node.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Stopped)
    }

    /// Lower-case label used in heartbeats and lifecycle events.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Initializing => "initializing",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
            NodeState::Error => "error",
        }
    }

    fn from_u8(value: u8) -> NodeState {
        match value {
            0 => NodeState::Created,
            1 => NodeState::Initializing,
            2 => NodeState::Running,
            3 => NodeState::Stopping,
            4 => NodeState::Stopped,
            _ => NodeState::Error,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            NodeState::Created => 0,
            NodeState::Initializing => 1,
            NodeState::Running => 2,
            NodeState::Stopping => 3,
            NodeState::Stopped => 4,
            NodeState::Error => 5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic cell
// ─────────────────────────────────────────────────────────────────────────────

/// Lock-free cell holding a [`NodeState`], readable from any thread.
///
/// [`StateCell::transition_to`] enforces the legal-transition graph; an
/// illegal request leaves the state unchanged and returns `false`, which the
/// runtime treats as a bug worth logging rather than a panic.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(NodeState::Created.to_u8()))
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt the transition `current → next`; `true` on success.
    pub fn transition_to(&self, next: NodeState) -> bool {
        let current = self.get();
        if !current.can_transition_to(next) {
            return false;
        }
        // Only the owning thread writes, so a plain store after the check is
        // race-free.
        self.0.store(next.to_u8(), Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use NodeState::*;
        let path = [Created, Initializing, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn error_edges_are_legal() {
        assert!(NodeState::Initializing.can_transition_to(NodeState::Error));
        assert!(NodeState::Running.can_transition_to(NodeState::Error));
        assert!(NodeState::Error.can_transition_to(NodeState::Stopping));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        assert!(!NodeState::Stopped.can_transition_to(NodeState::Running));
        assert!(!NodeState::Created.can_transition_to(NodeState::Running));
        assert!(!NodeState::Error.can_transition_to(NodeState::Running));
        assert!(!NodeState::Stopping.can_transition_to(NodeState::Running));
    }

    #[test]
    fn cell_enforces_graph() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), NodeState::Created);
        assert!(cell.transition_to(NodeState::Initializing));
        assert!(cell.transition_to(NodeState::Running));
        // Skipping Stopping is illegal.
        assert!(!cell.transition_to(NodeState::Stopped));
        assert_eq!(cell.get(), NodeState::Running);
        assert!(cell.transition_to(NodeState::Stopping));
        assert!(cell.transition_to(NodeState::Stopped));
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn state_labels_are_snake_case() {
        assert_eq!(NodeState::Initializing.as_str(), "initializing");
        assert_eq!(NodeState::Error.as_str(), "error");
    }
}
