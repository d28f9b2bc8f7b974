//! Balance-changed fan-out
//!
//! A single channel shared by every observer. Listeners register for one
//! identity and are only invoked for that identity's updates. Publishing is
//! synchronous: when `publish` returns, every matching listener has run.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::warn;
use uuid::Uuid;

use super::types::BalanceSnapshot;

/// Callback invoked with each new snapshot
pub type Listener = Arc<dyn Fn(&BalanceSnapshot) + Send + Sync>;

fn read_listeners(lock: &RwLock<Vec<Registration>>) -> RwLockReadGuard<'_, Vec<Registration>> {
    lock.read().unwrap_or_else(|poisoned: PoisonError<_>| {
        warn!("Listener registry was poisoned on read, recovering");
        poisoned.into_inner()
    })
}

fn write_listeners(lock: &RwLock<Vec<Registration>>) -> RwLockWriteGuard<'_, Vec<Registration>> {
    lock.write().unwrap_or_else(|poisoned: PoisonError<_>| {
        warn!("Listener registry was poisoned on write, recovering");
        poisoned.into_inner()
    })
}

struct Registration {
    id: Uuid,
    identity_id: String,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    // Registration order is invocation order
    listeners: RwLock<Vec<Registration>>,
}

impl Registry {
    fn remove(&self, id: Uuid) -> bool {
        let mut listeners = write_listeners(&self.listeners);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }
}

/// Fan-out of balance updates to every interested observer
#[derive(Clone, Default)]
pub struct UpdateBroadcaster {
    registry: Arc<Registry>,
}

impl UpdateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for updates to `identity_id`.
    ///
    /// The listener stays registered until the returned handle is disposed
    /// or dropped.
    pub fn subscribe<F>(&self, identity_id: &str, listener: F) -> Subscription
    where
        F: Fn(&BalanceSnapshot) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        write_listeners(&self.registry.listeners).push(Registration {
            id,
            identity_id: identity_id.to_string(),
            listener: Arc::new(listener),
        });
        tracing::debug!(user_id = identity_id, listener = %id, "Listener subscribed");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every listener registered for `identity_id`, in registration
    /// order. Returns the number of listeners notified.
    pub fn publish(&self, identity_id: &str, snapshot: &BalanceSnapshot) -> usize {
        // Clone out of the lock so listeners may subscribe or dispose re-entrantly
        let targets: Vec<Listener> = read_listeners(&self.registry.listeners)
            .iter()
            .filter(|r| r.identity_id == identity_id)
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in &targets {
            listener(snapshot);
        }
        targets.len()
    }

    /// Number of live listeners across all identities
    pub fn listener_count(&self) -> usize {
        read_listeners(&self.registry.listeners).len()
    }
}

/// Handle returned by [`UpdateBroadcaster::subscribe`]
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: Uuid,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Deregister the listener now
    pub fn dispose(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                tracing::debug!(listener = %self.id, "Listener disposed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::types::SubscriptionStatus;
    use chrono::Utc;
    use std::sync::Mutex;

    fn snapshot(identity: &str, credits: u64) -> BalanceSnapshot {
        BalanceSnapshot {
            identity_id: identity.to_string(),
            record_id: "sub_1".to_string(),
            credits_left: credits,
            is_active: true,
            plan_type: "monthly".to_string(),
            plan_end_date: Utc::now(),
            status: SubscriptionStatus::Active,
        }
    }

    #[test]
    fn test_publish_filters_by_identity() {
        let broadcaster = UpdateBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _sub = broadcaster.subscribe("u1", move |s| sink.lock().unwrap().push(s.credits_left));

        assert_eq!(broadcaster.publish("u2", &snapshot("u2", 99)), 0);
        assert_eq!(broadcaster.publish("u1", &snapshot("u1", 5)), 1);
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_publish_preserves_order() {
        let broadcaster = UpdateBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let sink = Arc::clone(&seen);
                broadcaster.subscribe("u1", move |s| sink.lock().unwrap().push((i, s.credits_left)))
            })
            .collect();

        broadcaster.publish("u1", &snapshot("u1", 10));
        broadcaster.publish("u1", &snapshot("u1", 7));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, 10), (1, 10), (2, 10), (0, 7), (1, 7), (2, 7)]
        );
        drop(subs);
    }

    #[test]
    fn test_dispose_and_drop_unsubscribe() {
        let broadcaster = UpdateBroadcaster::new();
        let a = broadcaster.subscribe("u1", |_| {});
        let b = broadcaster.subscribe("u1", |_| {});
        assert_eq!(broadcaster.listener_count(), 2);

        a.dispose();
        assert_eq!(broadcaster.listener_count(), 1);

        drop(b);
        assert_eq!(broadcaster.listener_count(), 0);
        assert_eq!(broadcaster.publish("u1", &snapshot("u1", 1)), 0);
    }

    #[test]
    fn test_listener_may_subscribe_during_publish() {
        let broadcaster = UpdateBroadcaster::new();
        let inner = broadcaster.clone();
        let spawned = Arc::new(Mutex::new(Vec::new()));
        let keep = Arc::clone(&spawned);

        let _sub = broadcaster.subscribe("u1", move |_| {
            keep.lock().unwrap().push(inner.subscribe("u1", |_| {}));
        });

        broadcaster.publish("u1", &snapshot("u1", 3));
        assert_eq!(broadcaster.listener_count(), 2);
    }
}
