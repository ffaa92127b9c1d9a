//! Event-type keyed handler registry.
//!
//! Callers register handlers for specific wire event types (or a catch-all)
//! and the loop thread dispatches every decoded [`ServerEvent`] through them.
//! A panicking handler is caught and logged; it never takes the connection
//! loop down with it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tracing::{error, warn};

use crate::events::ServerEvent;

/// Receives decoded inbound events on the connection loop thread.
///
/// Implementations must not block for long; the socket is not read while a
/// handler runs.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

#[derive(Default)]
struct Inner {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
}

/// Shared, cloneable handler table.
///
/// Registration may happen from any thread at any time; dispatch snapshots
/// the relevant handler lists under the read lock and invokes them outside
/// it, so a handler may itself register further handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events whose `type` equals `event_type`.
    pub fn on(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        match self.inner.write() {
            Ok(mut inner) => inner
                .by_type
                .entry(event_type.to_string())
                .or_default()
                .push(handler),
            Err(poisoned) => warn!(
                event_type,
                error = %poisoned,
                "handler registry poisoned; registration dropped"
            ),
        }
    }

    /// Register `handler` for every event regardless of type.
    pub fn on_any(&self, handler: Arc<dyn EventHandler>) {
        match self.inner.write() {
            Ok(mut inner) => inner.catch_all.push(handler),
            Err(poisoned) => warn!(
                error = %poisoned,
                "handler registry poisoned; registration dropped"
            ),
        }
    }

    /// Invoke every matching handler, catch-alls first, each in registration
    /// order.  Returns the number of handlers that ran.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let snapshot: Vec<Arc<dyn EventHandler>> = match self.inner.read() {
            Ok(inner) => {
                let mut handlers = inner.catch_all.clone();
                if let Some(typed) = inner.by_type.get(&event.event_type) {
                    handlers.extend(typed.iter().cloned());
                }
                handlers
            }
            Err(poisoned) => {
                warn!(error = %poisoned, "handler registry poisoned; dispatch skipped");
                return 0;
            }
        };

        for handler in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler.on_event(event)));
            if result.is_err() {
                error!(
                    event_type = %event.event_type,
                    "event handler panicked; continuing with remaining handlers"
                );
            }
        }
        snapshot.len()
    }
}
