//! `robokit-realtime` – Streaming Session Client
//!
//! Maintains a single logical WebSocket session to an external real-time
//! conversational endpoint, exposing a thread-safe API to the rest of the
//! framework while internally running a dedicated single-threaded event
//! loop.  Socket drops are recovered with capped exponential backoff;
//! exhausting the retry budget is surfaced as a fatal event, never a silent
//! stop.
//!
//! # Modules
//!
//! - [`state`] – [`ConnectionState`][state::ConnectionState] and the pure
//!   transition function driving the reconnection machine.
//! - [`backoff`] – [`ReconnectBackoff`][backoff::ReconnectBackoff]:
//!   `min(base · 2^(attempt−1), max)` delays.
//! - [`queue`] – [`OutboundQueue`][queue::OutboundQueue]: bounded FIFO for
//!   frames attempted while the socket is down; overflow drops the oldest.
//! - [`events`] – the `{"type": ...}` wire envelope:
//!   [`ClientEvent`][events::ClientEvent] builders and
//!   [`ServerEvent`][events::ServerEvent] decoding.
//! - [`handlers`] – [`HandlerRegistry`][handlers::HandlerRegistry]:
//!   event-type keyed handler lists with per-handler fault isolation.
//! - [`metrics`] – [`ConnectionMetrics`][metrics::ConnectionMetrics]
//!   snapshots (attempts, reconnects, frames in/out, uptime).
//! - [`manager`] – [`ConnectionManager`][manager::ConnectionManager]: the
//!   background thread, its event loop, and the thread-safe send bridge.
//! - [`node`] – [`RealtimeNode`][node::RealtimeNode]: hosts the manager
//!   inside a [`Node`][robokit_node::Node] and relays traffic to/from the
//!   message bus.

pub mod backoff;
pub mod events;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod state;

pub use backoff::ReconnectBackoff;
pub use events::{ClientEvent, ServerEvent};
pub use handlers::{EventHandler, HandlerRegistry};
pub use manager::ConnectionManager;
pub use metrics::ConnectionMetrics;
pub use node::RealtimeNode;
pub use state::ConnectionState;
