//! Typed pub/sub dispatch: event-type keyed handler registry.
//!
//! The router is deliberately decoupled from the socket. It consumes decoded
//! [`Envelope`]s from whatever feeds it and fans each one out to the handlers
//! registered for its routing key, in registration order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::message::Envelope;

/// Callback invoked for every envelope matching its subscription.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync + 'static>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

struct RouterInner {
    /// Registration order is preserved within each event type
    handlers: DashMap<String, Vec<HandlerEntry>>,
    next_id: AtomicU64,
}

/// Registry of per-event-type handlers with isolated dispatch.
///
/// Cloning is cheap and all clones share the same registry.
#[derive(Clone)]
pub struct DispatchRouter {
    inner: Arc<RouterInner>,
}

impl Default for DispatchRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler for an event type.
    ///
    /// Handlers for the same event type are invoked in registration order.
    /// Event types are opaque strings; subscribing to a type the server never
    /// emits is valid and simply never fires.
    #[must_use = "dropping the subscription handle forfeits the ability to unsubscribe"]
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .handlers
            .entry(event_type.clone())
            .or_default()
            .push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });

        Subscription {
            event_type,
            id,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Remove every handler for an event type.
    pub fn unsubscribe_all(&self, event_type: &str) {
        self.inner.handlers.remove(event_type);
    }

    /// Invoke every handler registered for the envelope's event type.
    ///
    /// The handler list is snapshotted before invocation, so a handler may
    /// subscribe or unsubscribe during dispatch; registry changes take effect
    /// from the next envelope. A panicking handler is logged and does not
    /// affect the remaining handlers or the transport.
    pub fn dispatch(&self, envelope: &Envelope) {
        let snapshot: Vec<Handler> = match self.inner.handlers.get(&envelope.event_type) {
            Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
            None => return,
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                tracing::error!(
                    event_type = %envelope.event_type,
                    "subscriber panicked while handling event"
                );
            }
        }
    }

    /// Number of handlers currently registered for an event type.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .get(event_type)
            .map_or(0, |entries| entries.len())
    }
}

/// Handle identifying one registered handler.
///
/// Dropping the handle does NOT unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) explicitly. The handle holds only a
/// weak reference, so it never keeps a dropped router alive.
#[must_use]
pub struct Subscription {
    event_type: String,
    id: u64,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// The event type this subscription listens on.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove this handler from the registry. Idempotent; unsubscribing an
    /// already-removed handler is a no-op.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        if let Some(mut entries) = inner.handlers.get_mut(&self.event_type) {
            entries.retain(|e| e.id != self.id);
        }
    }
}
