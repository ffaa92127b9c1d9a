//! `robokit-node` – Node Lifecycle & Supervision
//!
//! Every unit of behaviour in the framework runs as a *node*: an
//! independently-threaded object with an init → run-loop → cleanup lifecycle,
//! a periodic heartbeat, and a supervisor-applied restart policy.  A failing
//! node degrades its own functionality only; siblings keep running.
//!
//! # Modules
//!
//! - [`state`] – [`NodeState`][state::NodeState]: the lifecycle state machine
//!   with an explicit legal-transition predicate.
//! - [`node`] – the [`Node`][node::Node] trait, the
//!   [`NodeRuntime`][node::NodeRuntime] that hosts one node per OS thread,
//!   and the [`NodeHandle`][node::NodeHandle] used to observe and stop it.
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]:
//!   restart-policy enforcement with exponential backoff, backed by a
//!   heartbeat [`Watchdog`][supervisor::Watchdog].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod node;
pub mod state;
pub mod supervisor;
pub mod telemetry;

pub use node::{Node, NodeHandle, NodeRuntime};
pub use state::NodeState;
pub use supervisor::{RestartPolicy, Supervisor, Watchdog, restart_delay};
pub use telemetry::{TracerProviderGuard, init_tracing};
