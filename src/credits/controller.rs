//! Public facade over the credit cache
//!
//! Reads are served from the cache (stale-while-revalidate). Spends are
//! applied to the cache and broadcast before the authority confirms them,
//! then either confirmed or rolled back to the exact pre-spend snapshot.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::broadcast::{Subscription, UpdateBroadcaster};
use super::limits;
use super::refresh::RefreshCoordinator;
use super::remote::DynBalanceAuthority;
use super::store::{CacheEntry, CacheStore, Freshness};
use super::types::{BalanceSnapshot, DeductRequest, SpendCheck, UsageKind};
use crate::config::QuotaConfig;
use crate::error::{QuotaError, Result};

struct ControllerInner {
    config: QuotaConfig,
    store: Arc<CacheStore>,
    broadcaster: UpdateBroadcaster,
    coordinator: RefreshCoordinator,
    authority: DynBalanceAuthority,
    /// Spends per identity whose settlement has not finished yet
    pending_spends: DashMap<String, usize>,
}

impl ControllerInner {
    fn begin_spend(&self, identity_id: &str) {
        *self.pending_spends.entry(identity_id.to_string()).or_insert(0) += 1;
    }

    /// Mark one spend settled; returns whether others are still pending
    fn finish_spend(&self, identity_id: &str) -> bool {
        let remaining = match self.pending_spends.get_mut(identity_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        self.pending_spends.remove_if(identity_id, |_, count| *count == 0);
        remaining > 0
    }

    /// Insufficient credits: suspend the subscription and zero the cache.
    /// Always reports the spend as rejected.
    async fn exhaust(
        &self,
        identity_id: &str,
        epoch: u64,
        before: &BalanceSnapshot,
        amount: u64,
    ) {
        info!(
            user_id = identity_id,
            amount,
            available = before.credits_left,
            "Insufficient credits, suspending subscription"
        );

        match self.authority.suspend(identity_id).await {
            Ok(()) => {
                let exhausted = before.exhausted();
                if self
                    .store
                    .put_if_current(identity_id, epoch, exhausted.clone(), Instant::now())
                    .is_some()
                {
                    self.broadcaster.publish(identity_id, &exhausted);
                }
            }
            Err(e) => {
                warn!(user_id = identity_id, error = %e, "Suspend failed, cache left unchanged");
            }
        }
    }

    /// Confirm or roll back an optimistic spend.
    ///
    /// The written entry stays optimistic while other spends for the same
    /// identity are still unsettled.
    async fn settle(&self, epoch: u64, before: BalanceSnapshot, request: DeductRequest) -> bool {
        let identity_id = request.identity_id.as_str();

        let result = self.authority.deduct_and_log(&request).await;
        let others_pending = self.finish_spend(identity_id);

        match result {
            Ok(receipt) => {
                info!(
                    user_id = identity_id,
                    amount = request.amount,
                    purpose = %request.usage_type,
                    message = %receipt.message,
                    "Spend confirmed"
                );

                if let Some(current) = self.store.get(identity_id) {
                    let confirmed = current.snapshot;
                    if self
                        .store
                        .settle_if_current(
                            identity_id,
                            epoch,
                            confirmed.clone(),
                            Instant::now(),
                            others_pending,
                        )
                        .is_some()
                    {
                        self.broadcaster.publish(identity_id, &confirmed);
                        self.coordinator
                            .schedule_refresh(identity_id, self.config.reconcile_delay);
                    }
                }
                true
            }
            Err(e) => {
                warn!(
                    user_id = identity_id,
                    amount = request.amount,
                    error = %e,
                    "Spend not confirmed, rolling back"
                );
                if self
                    .store
                    .settle_if_current(
                        identity_id,
                        epoch,
                        before.clone(),
                        Instant::now(),
                        others_pending,
                    )
                    .is_some()
                {
                    self.broadcaster.publish(identity_id, &before);
                }
                false
            }
        }
    }
}

/// Credit balance facade: read, spend, refresh, observe
#[derive(Clone)]
pub struct QuotaController {
    inner: Arc<ControllerInner>,
}

impl QuotaController {
    pub fn new(authority: DynBalanceAuthority, config: QuotaConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.fresh_window, config.stale_window));
        let broadcaster = UpdateBroadcaster::new();
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            broadcaster.clone(),
            Arc::clone(&authority),
            config.debounce_delay,
        );

        Self {
            inner: Arc::new(ControllerInner {
                config,
                store,
                broadcaster,
                coordinator,
                authority,
                pending_spends: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.inner.config
    }

    /// Current balance from cache, never waiting on the network.
    ///
    /// Fresh entries are returned as is. Stale entries are returned and a
    /// debounced refresh is requested. Missing or expired entries trigger a
    /// forced refresh and return `None` until it lands.
    pub fn read_balance(&self, identity_id: &str) -> Option<BalanceSnapshot> {
        let entry = self.inner.store.get(identity_id);
        let freshness = entry.as_ref().map(|e| e.freshness(Instant::now()));
        match freshness {
            Some(Freshness::Fresh) => entry.map(|e| e.snapshot),
            Some(Freshness::Stale) => {
                self.inner.coordinator.request_refresh(identity_id);
                entry.map(|e| e.snapshot)
            }
            Some(Freshness::Expired) | None => {
                debug!(user_id = identity_id, "Balance not cached, loading");
                // Errors are logged by the coordinator; nobody is waiting here
                let _ = self.inner.coordinator.force_refresh(identity_id);
                None
            }
        }
    }

    /// Like [`read_balance`](Self::read_balance), but waits for the forced
    /// refresh when the cache cannot serve the read
    pub async fn load_balance(&self, identity_id: &str) -> Result<Option<BalanceSnapshot>> {
        if let Some(entry) = self.inner.store.get(identity_id) {
            match entry.freshness(Instant::now()) {
                Freshness::Fresh => return Ok(Some(entry.snapshot)),
                Freshness::Stale => {
                    self.inner.coordinator.request_refresh(identity_id);
                    return Ok(Some(entry.snapshot));
                }
                Freshness::Expired => {}
            }
        }
        self.force_refresh(identity_id).await
    }

    /// Fetch the true balance now, sharing any fetch already in flight.
    ///
    /// A failed fetch leaves the cached entry untouched and is reported only
    /// to this caller (and others that joined the same fetch).
    pub async fn force_refresh(&self, identity_id: &str) -> Result<Option<BalanceSnapshot>> {
        self.inner.coordinator.force_refresh(identity_id).wait().await
    }

    /// Spend `amount` credits for `purpose`.
    ///
    /// Returns `Ok(true)` once the authority confirmed the deduction,
    /// `Ok(false)` if the spend was rejected (nothing cached, insufficient
    /// credits, or the authority refused) and `Err` only for a zero amount.
    ///
    /// The cache reflects the deduction before this future first suspends.
    /// Once that optimistic write happened, confirmation or rollback runs to
    /// completion even if the returned future is dropped.
    pub async fn spend(&self, identity_id: &str, amount: u64, purpose: &str) -> Result<bool> {
        if amount == 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }

        let epoch = self.inner.store.epoch(identity_id);
        let Some(entry) = self.inner.store.get(identity_id) else {
            debug!(user_id = identity_id, "Spend rejected, balance not loaded");
            return Ok(false);
        };
        let before = entry.snapshot;

        if before.credits_left < amount {
            self.inner.exhaust(identity_id, epoch, &before, amount).await;
            return Ok(false);
        }

        let optimistic = before.after_spend(amount);
        self.inner.begin_spend(identity_id);
        self.inner
            .store
            .put_optimistic(identity_id, optimistic.clone(), Instant::now());
        self.inner.broadcaster.publish(identity_id, &optimistic);
        debug!(
            user_id = identity_id,
            amount,
            credits_left = optimistic.credits_left,
            "Optimistic spend applied"
        );

        let request = DeductRequest {
            identity_id: identity_id.to_string(),
            record_id: before.record_id.clone(),
            amount,
            usage_type: purpose.to_string(),
        };
        let inner = Arc::clone(&self.inner);
        let settle = tokio::spawn(async move { inner.settle(epoch, before, request).await });

        match settle.await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                error!(user_id = identity_id, error = %e, "Spend settlement task failed");
                Ok(false)
            }
        }
    }

    /// Spend the configured cost of one `kind` action
    pub async fn spend_for(&self, identity_id: &str, kind: UsageKind) -> Result<bool> {
        let cost = self.inner.config.costs.cost_of(kind);
        self.spend(identity_id, cost, kind.as_str()).await
    }

    /// Whether `amount` could be spent according to the cached snapshot
    pub fn check_spend(&self, identity_id: &str, amount: u64) -> SpendCheck {
        let entry = self.inner.store.get(identity_id);
        limits::check_spend(entry.as_ref().map(|e| &e.snapshot), amount, Utc::now())
    }

    /// Observe every snapshot change for `identity_id`
    pub fn subscribe<F>(&self, identity_id: &str, listener: F) -> Subscription
    where
        F: Fn(&BalanceSnapshot) + Send + Sync + 'static,
    {
        self.inner.broadcaster.subscribe(identity_id, listener)
    }

    /// Forget an identity. In-flight refreshes and spends for it finish
    /// without touching the cache.
    pub fn sign_out(&self, identity_id: &str) {
        self.inner.store.invalidate(identity_id);
        self.inner.coordinator.cancel(identity_id);
        info!(user_id = identity_id, "Signed out, credit cache cleared");
    }

    pub fn cache_status(&self, identity_id: &str) -> Option<Freshness> {
        self.inner
            .store
            .get(identity_id)
            .map(|e| e.freshness(Instant::now()))
    }

    pub fn cached_entry(&self, identity_id: &str) -> Option<CacheEntry> {
        self.inner.store.get(identity_id)
    }

    /// Whether a refresh is armed or running for this identity
    pub fn is_refreshing(&self, identity_id: &str) -> bool {
        self.inner.coordinator.is_pending(identity_id)
    }
}
