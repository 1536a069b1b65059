//! Authentication-state observers
//!
//! Callbacks run synchronously, in registration order, on the task that
//! performed the transition. `notify` snapshots the handler list before the
//! first callback runs, so:
//!
//! - a callback registered during a pass does not see that pass's event
//! - a callback unregistered during a pass still sees it
//!
//! Callbacks must not block; they are invoked while the token store holds
//! its state lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;

type Handler = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    entries: Mutex<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl Handlers {
    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Ordered set of auth-state callbacks. Clones share the same set.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    handlers: Arc<Handlers>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`; it stays registered until the returned
    /// `Subscription` is dropped or unsubscribed.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        trace!(subscriber_id = id, "auth subscriber registered");
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Invoke every registered callback with the new auth state.
    pub fn notify(&self, authenticated: bool) {
        let snapshot: Vec<Handler> = self
            .handlers
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        trace!(authenticated, subscribers = snapshot.len(), "notifying auth subscribers");
        for handler in snapshot {
            handler(authenticated);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle returned by [`SubscriberRegistry::on_change`].
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    handlers: Weak<Handlers>,
}

impl Subscription {
    /// Unregister now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}

    /// Keep the callback registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.handlers = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.remove(self.id);
            trace!(subscriber_id = self.id, "auth subscriber removed");
        }
    }
}
