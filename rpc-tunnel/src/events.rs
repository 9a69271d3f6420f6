//! Delivery of server-pushed events to registered listeners.
//!
//! The router is a plain name-to-handler map. It does not talk to the server;
//! the [`Tunnel`](crate::Tunnel) sends the `rpc.on`/`rpc.off` control calls
//! and updates the router alongside.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Listener for one event name. Receives the raw event payload.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Maps event names to at most one handler each.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, EventHandler>>,
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or remove the handler for `event`.
    ///
    /// Returns `true` when the subscription state of `event` changed, meaning
    /// a handler appeared where there was none or disappeared. Replacing one
    /// handler by another is not a change.
    pub fn set(&self, event: &str, handler: Option<EventHandler>) -> bool {
        let mut handlers = self.handlers.write();
        match handler {
            Some(handler) => handlers.insert(event.to_string(), handler).is_none(),
            None => handlers.remove(event).is_some(),
        }
    }

    /// Whether a handler is registered for `event`.
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.read().contains_key(event)
    }

    /// Names with an active handler, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the handler registered for `event` with `payload`.
    ///
    /// Unknown events are dropped. A panicking handler is logged and does not
    /// affect later deliveries. Returns `true` if a handler ran to completion.
    pub fn dispatch(&self, event: &str, payload: Value) -> bool {
        // clone out so the handler runs without holding the lock
        let handler = self.handlers.read().get(event).cloned();
        let Some(handler) = handler else {
            tracing::debug!(event, "no handler for event, dropping");
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(event, "event handler panicked");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("events", &self.events())
            .finish()
    }
}
