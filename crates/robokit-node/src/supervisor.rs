//! [`Supervisor`] – restart policy and heartbeat monitoring.
//!
//! The supervisor owns every [`NodeHandle`] in the process.  Each supervision
//! pass ([`Supervisor::poll`]) reaps nodes that ended in `Stopped` or
//! `Error`, applies the node's [`RestartPolicy`], and spawns due restarts
//! from the node's factory – a restart always re-creates a *fresh* node, it
//! never resurrects the old object.  Restart delays follow exponential
//! backoff: `min(base · 2^restart_count, max)`.
//!
//! Liveness is tracked by a [`Watchdog`] fed from the heartbeat topic: a node
//! that stops beating past its deadline is asked to stop, which turns it into
//! a reap-and-restart candidate on a later pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use robokit_bus::MessageBus;
use robokit_types::{Message, NodeConfig, RobotError, SupervisorConfig, topics};
use tracing::{info, warn};

use crate::node::{Node, NodeHandle, NodeRuntime};
use crate::state::NodeState;

// ─────────────────────────────────────────────────────────────────────────────
// Restart policy
// ─────────────────────────────────────────────────────────────────────────────

/// When the supervisor re-creates a node that has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any exit, clean or not.
    Always,
    /// Restart only after an `Error` exit.
    OnFailure,
    /// Never restart; the node stays down.
    Never,
}

impl RestartPolicy {
    /// `true` if a node that ended in `final_state` should be re-created.
    pub fn should_restart(self, final_state: NodeState) -> bool {
        match self {
            RestartPolicy::Always => matches!(final_state, NodeState::Stopped | NodeState::Error),
            RestartPolicy::OnFailure => final_state == NodeState::Error,
            RestartPolicy::Never => false,
        }
    }
}

/// Exponential restart backoff: `min(base · 2^restart_count, max)`.
pub fn restart_delay(base: Duration, max: Duration, restart_count: u32) -> Duration {
    let exponent = restart_count.min(63);
    let delay = base.as_secs_f64() * 2f64.powi(exponent as i32);
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Watchdog
// ─────────────────────────────────────────────────────────────────────────────

struct BeatEntry {
    last_beat: Instant,
    deadline: Duration,
}

/// Heartbeat deadline tracker.
///
/// Clone it cheaply – all clones share the same entry table, which is how a
/// bus subscription (a `Send + Sync` handler) can feed beats into the same
/// watchdog the supervisor polls.
#[derive(Clone, Default)]
pub struct Watchdog {
    entries: Arc<Mutex<HashMap<String, BeatEntry>>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `node` with the given heartbeat `deadline`.  The clock starts
    /// now, so a freshly registered node is on time.  Re-registering resets
    /// the clock.
    pub fn register(&self, node: &str, deadline: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                node.to_string(),
                BeatEntry {
                    last_beat: Instant::now(),
                    deadline,
                },
            );
        }
    }

    /// Stop tracking `node` (it was reaped or intentionally stopped).
    pub fn forget(&self, node: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(node);
        }
    }

    /// Record a heartbeat for `node`.  Unknown nodes are ignored.
    pub fn beat(&self, node: &str) {
        if let Ok(mut entries) = self.entries.lock()
            && let Some(entry) = entries.get_mut(node)
        {
            entry.last_beat = Instant::now();
        }
    }

    /// `true` if `node` is tracked and has missed its deadline.
    pub fn is_late(&self, node: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(node)
                    .is_some_and(|e| e.last_beat.elapsed() > e.deadline)
            })
            .unwrap_or(false)
    }

    /// Names of every tracked node past its deadline, in no particular order.
    pub fn late_nodes(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.last_beat.elapsed() > e.deadline)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe this watchdog to [`topics::HEARTBEAT`] on `bus`, so every
    /// published heartbeat refreshes the matching entry.
    pub fn attach(&self, bus: &MessageBus) -> Result<(), RobotError> {
        let feed = self.clone();
        bus.subscribe(
            "watchdog",
            topics::HEARTBEAT,
            Arc::new(move |message: &Message| {
                if let Some(node) = message.payload.get("node_name").and_then(|v| v.as_str()) {
                    feed.beat(node);
                }
            }),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Produces a fresh node instance for every (re)start.
pub type NodeFactory = Box<dyn Fn() -> Box<dyn Node> + Send>;

struct Supervised {
    name: String,
    policy: RestartPolicy,
    node_config: NodeConfig,
    factory: NodeFactory,
    handle: Option<NodeHandle>,
    restart_count: u32,
    restart_due: Option<Instant>,
}

/// Owns node handles and applies restart policy.
///
/// Drive it by calling [`poll`][Supervisor::poll] from the launcher's
/// control loop; each call performs one supervision pass and is cheap.
pub struct Supervisor {
    bus: MessageBus,
    config: SupervisorConfig,
    watchdog: Watchdog,
    nodes: Vec<Supervised>,
}

impl Supervisor {
    /// Create a supervisor whose watchdog listens on the heartbeat topic of
    /// `bus`.
    pub fn new(bus: MessageBus, config: SupervisorConfig) -> Result<Self, RobotError> {
        let watchdog = Watchdog::new();
        watchdog.attach(&bus)?;
        Ok(Self {
            bus,
            config,
            watchdog,
            nodes: Vec::new(),
        })
    }

    /// Register a node under `policy`.  `factory` is invoked once per
    /// (re)start and must yield a fresh instance each time.
    pub fn add_node(
        &mut self,
        name: &str,
        policy: RestartPolicy,
        node_config: NodeConfig,
        factory: NodeFactory,
    ) {
        self.nodes.push(Supervised {
            name: name.to_string(),
            policy,
            node_config,
            factory,
            handle: None,
            restart_count: 0,
            restart_due: None,
        });
    }

    /// Spawn every registered node that is not yet running.
    pub fn start_all(&mut self) {
        for entry in &mut self.nodes {
            if entry.handle.is_none() && entry.restart_due.is_none() {
                Self::spawn_entry(&self.bus, &self.watchdog, &self.config, entry);
            }
        }
    }

    /// One supervision pass: reap exited nodes, apply restart policy, spawn
    /// due restarts, and stop nodes whose heartbeat went silent.
    pub fn poll(&mut self) {
        for entry in &mut self.nodes {
            // Stop nodes that stopped beating; they become reap candidates.
            if let Some(handle) = &entry.handle
                && handle.state() == NodeState::Running
                && self.watchdog.is_late(&entry.name)
            {
                warn!(node = %entry.name, "heartbeat missed; requesting stop");
                handle.request_stop();
            }

            // Reap finished nodes and schedule restarts.
            if let Some(handle) = &mut entry.handle {
                let state = handle.state();
                if matches!(state, NodeState::Stopped | NodeState::Error) && handle.is_finished() {
                    handle.join(entry.node_config.cleanup_timeout());
                    entry.handle = None;
                    self.watchdog.forget(&entry.name);

                    if entry.policy.should_restart(state) {
                        let delay = restart_delay(
                            self.config.restart_base_delay(),
                            self.config.restart_max_delay(),
                            entry.restart_count,
                        );
                        info!(
                            node = %entry.name,
                            final_state = state.as_str(),
                            restart_count = entry.restart_count,
                            delay_ms = delay.as_millis() as u64,
                            "scheduling restart"
                        );
                        entry.restart_due = Some(Instant::now() + delay);
                        entry.restart_count += 1;
                    } else {
                        info!(node = %entry.name, final_state = state.as_str(), "node reaped, no restart");
                    }
                }
            }

            // Spawn restarts whose backoff has elapsed.
            if entry.handle.is_none()
                && entry.restart_due.is_some_and(|due| Instant::now() >= due)
            {
                entry.restart_due = None;
                Self::spawn_entry(&self.bus, &self.watchdog, &self.config, entry);
            }
        }
    }

    /// Request a stop on every node and join them, abandoning any thread that
    /// outlives its cleanup timeout.
    pub fn shutdown(&mut self) {
        for entry in &mut self.nodes {
            entry.restart_due = None;
            if let Some(handle) = &entry.handle {
                handle.request_stop();
            }
        }
        for entry in &mut self.nodes {
            if let Some(mut handle) = entry.handle.take() {
                handle.join(entry.node_config.cleanup_timeout());
                self.watchdog.forget(&entry.name);
            }
        }
    }

    /// Current state of `name`, or `None` when it is down or unknown.
    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.nodes
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.handle.as_ref().map(NodeHandle::state))
    }

    /// How many times `name` has been restarted so far.
    pub fn restart_count(&self, name: &str) -> u32 {
        self.nodes
            .iter()
            .find(|e| e.name == name)
            .map_or(0, |e| e.restart_count)
    }

    fn spawn_entry(
        bus: &MessageBus,
        watchdog: &Watchdog,
        config: &SupervisorConfig,
        entry: &mut Supervised,
    ) {
        let node = (entry.factory)();
        watchdog.register(&entry.name, config.heartbeat_timeout());
        entry.handle = Some(NodeRuntime::spawn(
            node,
            bus.clone(),
            entry.node_config.clone(),
        ));
        info!(node = %entry.name, restart_count = entry.restart_count, "node spawned");
    }
}
