//! Process-wide balance cache with freshness windows
//!
//! Entries are served fresh for `fresh_window`, served stale (with a
//! background refresh) until `stale_window`, and treated as missing after
//! that. The cache lives for the process; it is only dropped per identity on
//! sign-out.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::types::BalanceSnapshot;

/// Helper to acquire read lock with poison recovery
fn acquire_read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned: PoisonError<RwLockReadGuard<'_, T>>| {
        warn!("RwLock was poisoned on read, recovering inner value");
        poisoned.into_inner()
    })
}

/// Helper to acquire write lock with poison recovery
fn acquire_write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned: PoisonError<RwLockWriteGuard<'_, T>>| {
        warn!("RwLock was poisoned on write, recovering inner value");
        poisoned.into_inner()
    })
}

/// How a cached entry may be served at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve without any network activity
    Fresh,
    /// Serve, and revalidate in the background
    Stale,
    /// Too old to serve
    Expired,
}

/// A snapshot plus freshness bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub snapshot: BalanceSnapshot,
    pub fetched_at: Instant,
    pub fresh_until: Instant,
    pub stale_until: Instant,
    optimistic: bool,
}

impl CacheEntry {
    pub fn freshness(&self, now: Instant) -> Freshness {
        if now < self.fresh_until {
            Freshness::Fresh
        } else if now < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// True while a local spend is awaiting confirmation
    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, CacheEntry>,
    /// Bumped on every invalidation so late async continuations can tell
    /// that the identity they started for has signed out.
    epochs: HashMap<String, u64>,
}

/// Keyed store of balance snapshots
pub struct CacheStore {
    inner: RwLock<StoreInner>,
    fresh_window: Duration,
    stale_window: Duration,
}

impl CacheStore {
    pub fn new(fresh_window: Duration, stale_window: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            fresh_window,
            stale_window,
        }
    }

    pub fn get(&self, identity_id: &str) -> Option<CacheEntry> {
        acquire_read_lock(&self.inner).entries.get(identity_id).cloned()
    }

    /// Store a confirmed snapshot stamped at `now`
    pub fn put(&self, identity_id: &str, snapshot: BalanceSnapshot, now: Instant) -> CacheEntry {
        let mut inner = acquire_write_lock(&self.inner);
        self.write_entry(&mut inner, identity_id, snapshot, now, false)
    }

    /// Store an unconfirmed local guess stamped at `now`
    pub fn put_optimistic(
        &self,
        identity_id: &str,
        snapshot: BalanceSnapshot,
        now: Instant,
    ) -> CacheEntry {
        let mut inner = acquire_write_lock(&self.inner);
        self.write_entry(&mut inner, identity_id, snapshot, now, true)
    }

    /// Write only if the identity has not been invalidated since `epoch` was
    /// read. Returns `None` when the write was dropped.
    pub fn put_if_current(
        &self,
        identity_id: &str,
        epoch: u64,
        snapshot: BalanceSnapshot,
        now: Instant,
    ) -> Option<CacheEntry> {
        self.settle_if_current(identity_id, epoch, snapshot, now, false)
    }

    /// Like [`put_if_current`](Self::put_if_current), but the entry stays
    /// marked optimistic when `optimistic` is set (other spends still pending)
    pub fn settle_if_current(
        &self,
        identity_id: &str,
        epoch: u64,
        snapshot: BalanceSnapshot,
        now: Instant,
        optimistic: bool,
    ) -> Option<CacheEntry> {
        let mut inner = acquire_write_lock(&self.inner);
        if inner.epochs.get(identity_id).copied().unwrap_or(0) != epoch {
            tracing::debug!(user_id = identity_id, "Dropping write for signed-out identity");
            return None;
        }
        Some(self.write_entry(&mut inner, identity_id, snapshot, now, optimistic))
    }

    /// Current invalidation epoch for an identity
    pub fn epoch(&self, identity_id: &str) -> u64 {
        acquire_read_lock(&self.inner)
            .epochs
            .get(identity_id)
            .copied()
            .unwrap_or(0)
    }

    /// Remove the entry for an identity (on sign-out)
    pub fn invalidate(&self, identity_id: &str) -> Option<CacheEntry> {
        let mut inner = acquire_write_lock(&self.inner);
        *inner.epochs.entry(identity_id.to_string()).or_insert(0) += 1;
        let removed = inner.entries.remove(identity_id);
        tracing::debug!(user_id = identity_id, "Cleared credit cache");
        removed
    }

    pub fn len(&self) -> usize {
        acquire_read_lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_entry(
        &self,
        inner: &mut StoreInner,
        identity_id: &str,
        snapshot: BalanceSnapshot,
        now: Instant,
        optimistic: bool,
    ) -> CacheEntry {
        let entry = CacheEntry {
            snapshot,
            fetched_at: now,
            fresh_until: now + self.fresh_window,
            stale_until: now + self.stale_window,
            optimistic,
        };
        tracing::debug!(
            user_id = identity_id,
            credits_left = entry.snapshot.credits_left,
            optimistic,
            "Caching balance"
        );
        inner.entries.insert(identity_id.to_string(), entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::types::SubscriptionStatus;
    use chrono::Utc;

    fn snapshot(credits: u64) -> BalanceSnapshot {
        BalanceSnapshot {
            identity_id: "u1".to_string(),
            record_id: "sub_1".to_string(),
            credits_left: credits,
            is_active: credits > 0,
            plan_type: "monthly".to_string(),
            plan_end_date: Utc::now() + chrono::Duration::days(30),
            status: SubscriptionStatus::Active,
        }
    }

    fn store() -> CacheStore {
        CacheStore::new(Duration::from_secs(180), Duration::from_secs(480))
    }

    #[test]
    fn test_put_computes_windows() {
        let store = store();
        let now = Instant::now();
        let entry = store.put("u1", snapshot(30), now);

        assert_eq!(entry.fetched_at, now);
        assert_eq!(entry.fresh_until, now + Duration::from_secs(180));
        assert_eq!(entry.stale_until, now + Duration::from_secs(480));
        assert!(!entry.is_optimistic());
        assert_eq!(store.get("u1").unwrap().snapshot.credits_left, 30);
    }

    #[test]
    fn test_freshness_transitions() {
        let store = store();
        let t0 = Instant::now();
        let entry = store.put("u1", snapshot(30), t0);

        assert_eq!(entry.freshness(t0 + Duration::from_secs(120)), Freshness::Fresh);
        assert_eq!(entry.freshness(t0 + Duration::from_secs(300)), Freshness::Stale);
        assert_eq!(entry.freshness(t0 + Duration::from_secs(540)), Freshness::Expired);
    }

    #[test]
    fn test_invalidate_drops_entry_and_bumps_epoch() {
        let store = store();
        store.put("u1", snapshot(30), Instant::now());
        let epoch = store.epoch("u1");

        assert!(store.invalidate("u1").is_some());
        assert!(store.get("u1").is_none());
        assert_eq!(store.epoch("u1"), epoch + 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_if_current_rejects_stale_epoch() {
        let store = store();
        let epoch = store.epoch("u1");
        store.invalidate("u1");

        assert!(store
            .put_if_current("u1", epoch, snapshot(10), Instant::now())
            .is_none());
        assert!(store.get("u1").is_none());

        let fresh_epoch = store.epoch("u1");
        assert!(store
            .put_if_current("u1", fresh_epoch, snapshot(10), Instant::now())
            .is_some());
    }

    #[test]
    fn test_optimistic_flag() {
        let store = store();
        let entry = store.put_optimistic("u1", snapshot(5), Instant::now());
        assert!(entry.is_optimistic());
    }
}
