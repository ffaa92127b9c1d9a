//! `robokit-bus` – The Nervous System
//!
//! Routes messages between independently-threaded nodes without caring about
//! their meaning.  One process, one bus instance, passed explicitly to every
//! node at construction time – never reached through ambient global state.
//!
//! # Modules
//!
//! - [`bus`] – [`MessageBus`][bus::MessageBus]: topic-keyed
//!   publish/subscribe router with synchronous caller-thread dispatch and
//!   per-subscriber fault isolation.

pub mod bus;

pub use bus::{MessageBus, MessageHandler};
