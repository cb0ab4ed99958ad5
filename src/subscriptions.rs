//! Subscription registry.
//!
//! Tracks the event names a consumer is interested in. Removing a name
//! publishes a notification that teardown logic (unbinding the routing key)
//! listens to.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

const REMOVAL_CHANNEL_CAPACITY: usize = 256;

/// Thread-safe set of subscribed event names.
pub struct SubscriptionRegistry {
    names: Mutex<HashSet<String>>,
    removals: broadcast::Sender<String>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (removals, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            names: Mutex::new(HashSet::new()),
            removals,
        }
    }

    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `name`. Returns false if it was already present.
    pub fn add_subscription(&self, name: &str) -> bool {
        let added = self.names().insert(name.to_string());
        if added {
            debug!(event = name, "Subscription added");
        }
        added
    }

    /// Remove `name`, emitting one `on_event_removed` notification if it
    /// was present. Returns whether anything was removed.
    pub fn remove_subscription(&self, name: &str) -> bool {
        let removed = self.names().remove(name);
        if removed {
            debug!(event = name, "Subscription removed");
            // No listeners is fine.
            let _ = self.removals.send(name.to_string());
        }
        removed
    }

    pub fn has_subscriptions_for_event(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    /// Drop every subscription without notifications.
    pub fn clear(&self) {
        self.names().clear();
    }

    /// Receive `on_event_removed` notifications from now on.
    pub fn subscribe_removals(&self) -> broadcast::Receiver<String> {
        self.removals.subscribe()
    }
}
