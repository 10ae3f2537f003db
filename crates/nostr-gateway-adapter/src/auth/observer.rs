/*
[INPUT]:  Identity change callbacks registered by consumers
[OUTPUT]: Fan-out of IdentityChange notifications with unsubscribe tokens
[POS]:    Auth layer - identity observer registry
[UPDATE]: When notification payloads or delivery rules change
*/

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::types::Identity;

/// What happened to the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    Authenticated(Identity),
    LoggedOut,
    Expired,
    Revoked,
}

impl IdentityChange {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            IdentityChange::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&IdentityChange) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback>>,
}

impl Observers {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Callback>> {
        match self.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Registry of identity observers. Callbacks run in registration order.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Observers>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&IdentityChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `change` to every observer. A panicking observer is logged and skipped.
    pub fn notify(&self, change: &IdentityChange) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let callbacks: Vec<(u64, Callback)> = self
            .inner
            .lock()
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                warn!(observer = id, change = ?change, "identity observer panicked");
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

/// Token returned by [`ObserverRegistry::subscribe`]. Dropping it removes the observer.
#[must_use = "dropping the subscription removes the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<Observers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
