//! Debounced, deduplicated balance refreshes
//!
//! Guarantees at most one in-flight fetch per identity. Non-forced requests
//! arm a single debounce timer; further requests while the timer is armed or
//! a fetch is running are absorbed. A forced request cancels the armed timer
//! and either starts a fetch immediately or joins the one already running.
//!
//! Every check-and-mark happens under the identity's `DashMap` entry, before
//! any suspension point.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::broadcast::UpdateBroadcaster;
use super::remote::DynBalanceAuthority;
use super::store::CacheStore;
use super::types::BalanceSnapshot;
use crate::error::{QuotaError, RemoteError};

/// What a refresh produced. `Ok(None)` means the identity signed out while
/// the fetch was running and the result was discarded.
pub type RefreshOutcome = Result<Option<BalanceSnapshot>, RemoteError>;

#[derive(Default)]
struct RefreshSlot {
    /// Armed debounce timer, if any
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the armed timer is cancelled; a timer that wakes with
    /// an older generation must not fetch.
    generation: u64,
    in_flight: bool,
    /// Forced callers waiting on the in-flight fetch
    waiters: Vec<Waiter>,
}

/// A forced caller, tagged with the store epoch it asked under
struct Waiter {
    epoch: u64,
    tx: oneshot::Sender<RefreshOutcome>,
}

impl RefreshSlot {
    fn is_idle(&self) -> bool {
        !self.in_flight && self.timer.is_none() && self.waiters.is_empty()
    }

    fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                self.generation += 1;
                true
            }
            None => false,
        }
    }
}

struct CoordinatorInner {
    store: Arc<CacheStore>,
    broadcaster: UpdateBroadcaster,
    authority: DynBalanceAuthority,
    debounce_delay: Duration,
    slots: DashMap<String, RefreshSlot>,
}

/// Clears the in-flight mark when a fetch ends, however it ends.
///
/// Waiters that asked under the fetch's epoch get its outcome. Waiters that
/// asked after a sign-out (a newer epoch) are carried over to a new fetch,
/// since the result of this one was discarded. If the fetch task is aborted
/// or panics, waiters see their sender dropped.
struct FetchGuard {
    inner: Arc<CoordinatorInner>,
    identity_id: String,
    epoch: u64,
    outcome: Option<RefreshOutcome>,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let id = self.identity_id.as_str();
        let Some(outcome) = self.outcome.take() else {
            if let Some(mut slot) = self.inner.slots.get_mut(id) {
                slot.in_flight = false;
                slot.waiters.clear();
            }
            self.inner.slots.remove_if(id, |_, slot| slot.is_idle());
            return;
        };

        let current_epoch = self.inner.store.epoch(id);
        let (ready, restart) = match self.inner.slots.get_mut(id) {
            Some(mut slot) => {
                let (newer, ready): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.waiters)
                    .into_iter()
                    .partition(|w| w.epoch > self.epoch);
                let restart = !newer.is_empty();
                slot.waiters = newer;
                slot.in_flight = restart;
                (ready, restart)
            }
            None => (Vec::new(), false),
        };

        if restart {
            debug!(user_id = id, "Identity signed back in during fetch, fetching again");
            let inner = Arc::clone(&self.inner);
            let identity = self.identity_id.clone();
            tokio::spawn(async move {
                inner.run_fetch(identity, current_epoch).await;
            });
        } else {
            self.inner.slots.remove_if(id, |_, slot| slot.is_idle());
        }

        for waiter in ready {
            let reply = if waiter.epoch == self.epoch {
                outcome.clone()
            } else {
                Ok(None)
            };
            let _ = waiter.tx.send(reply);
        }
    }
}

impl CoordinatorInner {
    async fn run_fetch(self: Arc<Self>, identity_id: String, epoch: u64) {
        let mut guard = FetchGuard {
            inner: Arc::clone(&self),
            identity_id: identity_id.clone(),
            epoch,
            outcome: None,
        };
        let identity_id = identity_id.as_str();

        debug!(user_id = identity_id, "Fetching balance");
        let outcome = match self.authority.fetch_balance(identity_id).await {
            Ok(record) => {
                let snapshot = record.into_snapshot(identity_id, Utc::now());
                match self
                    .store
                    .put_if_current(identity_id, epoch, snapshot.clone(), Instant::now())
                {
                    Some(_) => {
                        self.broadcaster.publish(identity_id, &snapshot);
                        Ok(Some(snapshot))
                    }
                    None => Ok(None),
                }
            }
            Err(e) => {
                // Last good entry stays in place
                warn!(user_id = identity_id, error = %e, "Balance refresh failed");
                Err(e)
            }
        };
        guard.outcome = Some(outcome);
    }

    async fn fire_debounced(self: Arc<Self>, identity_id: String, generation: u64, epoch: u64) {
        {
            let Some(mut slot) = self.slots.get_mut(&identity_id) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.timer = None;
            if slot.in_flight {
                return;
            }
            slot.in_flight = true;
        }
        self.run_fetch(identity_id, epoch).await;
    }
}

/// Pending handle for a forced refresh
#[must_use = "a RefreshWaiter does nothing unless waited on"]
pub struct RefreshWaiter {
    identity_id: String,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshWaiter {
    /// Wait for the fetch this caller started or joined
    pub async fn wait(self) -> Result<Option<BalanceSnapshot>, QuotaError> {
        match self.rx.await {
            Ok(outcome) => outcome.map_err(QuotaError::from),
            Err(_) => Err(QuotaError::RefreshAbandoned(self.identity_id)),
        }
    }
}

/// Per-identity refresh scheduler
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        broadcaster: UpdateBroadcaster,
        authority: DynBalanceAuthority,
        debounce_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                broadcaster,
                authority,
                debounce_delay,
                slots: DashMap::new(),
            }),
        }
    }

    /// Non-forced refresh after the debounce delay.
    ///
    /// Returns `false` when the request was absorbed by a pending timer or an
    /// in-flight fetch.
    pub fn request_refresh(&self, identity_id: &str) -> bool {
        self.schedule_refresh(identity_id, self.inner.debounce_delay)
    }

    /// Non-forced refresh after a custom delay, with the same absorption rules
    pub fn schedule_refresh(&self, identity_id: &str, delay: Duration) -> bool {
        let epoch = self.inner.store.epoch(identity_id);
        let mut slot = self.inner.slots.entry(identity_id.to_string()).or_default();
        if slot.in_flight || slot.timer.is_some() {
            debug!(user_id = identity_id, "Refresh already pending, absorbed");
            return false;
        }

        slot.generation += 1;
        let generation = slot.generation;
        let inner = Arc::clone(&self.inner);
        let identity = identity_id.to_string();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire_debounced(identity, generation, epoch).await;
        }));
        debug!(user_id = identity_id, delay_ms = delay.as_millis() as u64, "Refresh scheduled");
        true
    }

    /// Fetch now, cancelling any armed debounce timer.
    ///
    /// Joins the in-flight fetch if there is one, so concurrent forced
    /// callers share a single network call.
    pub fn force_refresh(&self, identity_id: &str) -> RefreshWaiter {
        let (tx, rx) = oneshot::channel();
        let epoch = self.inner.store.epoch(identity_id);

        let start = {
            let mut slot = self.inner.slots.entry(identity_id.to_string()).or_default();
            if slot.cancel_timer() {
                debug!(user_id = identity_id, "Debounced refresh preempted by forced refresh");
            }
            slot.waiters.push(Waiter { epoch, tx });
            if slot.in_flight {
                false
            } else {
                slot.in_flight = true;
                true
            }
        };

        if start {
            let inner = Arc::clone(&self.inner);
            let identity = identity_id.to_string();
            tokio::spawn(async move {
                inner.run_fetch(identity, epoch).await;
            });
        } else {
            debug!(user_id = identity_id, "Joined in-flight refresh");
        }

        RefreshWaiter {
            identity_id: identity_id.to_string(),
            rx,
        }
    }

    /// Drop any armed timer for an identity (on sign-out). An in-flight fetch
    /// is left to finish; the store discards its result, and callers that
    /// force a refresh after the sign-out get a fetch of their own.
    pub fn cancel(&self, identity_id: &str) {
        if let Some(mut slot) = self.inner.slots.get_mut(identity_id) {
            slot.cancel_timer();
        }
        self.inner.slots.remove_if(identity_id, |_, slot| slot.is_idle());
    }

    /// Whether a timer is armed or a fetch is running for this identity
    pub fn is_pending(&self, identity_id: &str) -> bool {
        self.inner
            .slots
            .get(identity_id)
            .map(|slot| slot.in_flight || slot.timer.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::memory::MemoryAuthority;
    use std::sync::Mutex;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    struct Fixture {
        authority: Arc<MemoryAuthority>,
        store: Arc<CacheStore>,
        broadcaster: UpdateBroadcaster,
        coordinator: RefreshCoordinator,
    }

    fn fixture(latency: Option<Duration>) -> Fixture {
        let authority = Arc::new(match latency {
            Some(latency) => MemoryAuthority::with_latency(latency),
            None => MemoryAuthority::new(),
        });
        authority.open_account("u1", 30, 30);
        let store = Arc::new(CacheStore::new(
            Duration::from_secs(180),
            Duration::from_secs(480),
        ));
        let broadcaster = UpdateBroadcaster::new();
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            broadcaster.clone(),
            authority.clone(),
            DEBOUNCE,
        );
        Fixture {
            authority,
            store,
            broadcaster,
            coordinator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_requests_collapses_to_one_fetch() {
        let f = fixture(None);

        assert!(f.coordinator.request_refresh("u1"));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!f.coordinator.request_refresh("u1"));
        }
        assert_eq!(f.authority.calls().fetch(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(f.authority.calls().fetch(), 1);
        assert_eq!(f.store.get("u1").unwrap().snapshot.credits_left, 30);
        assert!(!f.coordinator.is_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_preempts_timer() {
        let f = fixture(None);

        f.coordinator.request_refresh("u1");
        let snapshot = f.coordinator.force_refresh("u1").wait().await.unwrap();
        assert_eq!(snapshot.unwrap().credits_left, 30);
        assert_eq!(f.authority.calls().fetch(), 1);

        // The cancelled timer must not fire a second fetch
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(f.authority.calls().fetch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_forced_refreshes_share_one_fetch() {
        let f = fixture(Some(Duration::from_millis(50)));

        let waiters: Vec<RefreshWaiter> =
            (0..5).map(|_| f.coordinator.force_refresh("u1")).collect();
        let results = futures::future::join_all(waiters.into_iter().map(|w| w.wait())).await;

        assert_eq!(f.authority.calls().fetch(), 1);
        for result in results {
            assert_eq!(result.unwrap().unwrap().credits_left, 30);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_fetch_is_absorbed() {
        let f = fixture(Some(Duration::from_millis(100)));

        let waiter = f.coordinator.force_refresh("u1");
        tokio::task::yield_now().await;
        assert!(!f.coordinator.request_refresh("u1"));
        waiter.wait().await.unwrap();

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(f.authority.calls().fetch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_last_good_entry() {
        let f = fixture(None);
        f.coordinator.force_refresh("u1").wait().await.unwrap();

        f.authority.set_credits("u1", 3);
        f.authority.fail_next_fetch(RemoteError::Transport("connection reset".into()));
        let err = f.coordinator.force_refresh("u1").wait().await.unwrap_err();

        assert!(matches!(err, QuotaError::Remote(RemoteError::Transport(_))));
        assert_eq!(f.store.get("u1").unwrap().snapshot.credits_left, 30);
        assert!(!f.coordinator.is_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_publishes_snapshot() {
        let f = fixture(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = f
            .broadcaster
            .subscribe("u1", move |s| sink.lock().unwrap().push(s.credits_left));

        f.coordinator.force_refresh("u1").wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_discarded_after_sign_out() {
        let f = fixture(Some(Duration::from_millis(100)));

        let waiter = f.coordinator.force_refresh("u1");
        tokio::task::yield_now().await;
        f.store.invalidate("u1");
        f.coordinator.cancel("u1");

        assert_eq!(waiter.wait().await.unwrap(), None);
        assert!(f.store.get("u1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_after_sign_out_fetches_again() {
        let f = fixture(Some(Duration::from_millis(100)));

        let before = f.coordinator.force_refresh("u1");
        tokio::task::yield_now().await;
        f.store.invalidate("u1");
        f.coordinator.cancel("u1");

        // Signed back in while the old fetch is still running
        let after = f.coordinator.force_refresh("u1");
        assert_eq!(before.wait().await.unwrap(), None);
        assert_eq!(after.wait().await.unwrap().unwrap().credits_left, 30);

        assert_eq!(f.authority.calls().fetch(), 2);
        assert_eq!(f.store.get("u1").unwrap().snapshot.credits_left, 30);
        assert!(!f.coordinator.is_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms_timer() {
        let f = fixture(None);

        f.coordinator.request_refresh("u1");
        f.coordinator.cancel("u1");
        assert!(!f.coordinator.is_pending("u1"));

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(f.authority.calls().fetch(), 0);
    }
}
