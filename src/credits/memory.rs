//! In-process balance authority
//!
//! Keeps balances and the usage log behind a single mutex so deduct-and-log
//! is atomic. Used by the demo binary and as a scripted double in tests:
//! every call is counted and failures can be queued per operation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

use super::remote::BalanceAuthority;
use super::types::{BalanceRecord, DeductReceipt, DeductRequest, SubscriptionStatus};
use crate::error::RemoteError;

/// Row in the usage log written by deduct-and-log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLogEntry {
    pub identity_id: String,
    pub record_id: String,
    pub amount: u64,
    pub usage_type: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Default)]
struct Ledger {
    accounts: HashMap<String, BalanceRecord>,
    usage_log: Vec<UsageLogEntry>,
    fetch_failures: VecDeque<RemoteError>,
    deduct_failures: VecDeque<RemoteError>,
    suspend_failures: VecDeque<RemoteError>,
}

/// Call counters, one per operation
#[derive(Debug, Default)]
pub struct CallCounts {
    fetch: AtomicUsize,
    deduct: AtomicUsize,
    suspend: AtomicUsize,
}

impl CallCounts {
    pub fn fetch(&self) -> usize {
        self.fetch.load(Ordering::SeqCst)
    }

    pub fn deduct(&self) -> usize {
        self.deduct.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) -> usize {
        self.suspend.load(Ordering::SeqCst)
    }
}

/// Mutex-guarded ledger implementing [`BalanceAuthority`]
#[derive(Default)]
pub struct MemoryAuthority {
    ledger: Mutex<Ledger>,
    calls: CallCounts,
    latency: Option<Duration>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before touching the ledger
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| {
            warn!("Ledger mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Create or replace an active account with a plan ending `plan_days` from now
    pub fn open_account(&self, identity_id: &str, credits: i64, plan_days: i64) {
        let record = BalanceRecord {
            record_id: format!("sub_{}", identity_id),
            credits_left: credits,
            plan_type: "monthly".to_string(),
            plan_end_date: Utc::now() + ChronoDuration::days(plan_days),
            sub_status: SubscriptionStatus::Active,
        };
        self.ledger().accounts.insert(identity_id.to_string(), record);
    }

    /// Add credits and reactivate the subscription (an external top-up)
    pub fn replenish(&self, identity_id: &str, credits: i64) {
        if let Some(record) = self.ledger().accounts.get_mut(identity_id) {
            record.credits_left += credits;
            record.sub_status = SubscriptionStatus::Active;
        }
    }

    /// Set the balance directly, as another device spending would
    pub fn set_credits(&self, identity_id: &str, credits: i64) {
        if let Some(record) = self.ledger().accounts.get_mut(identity_id) {
            record.credits_left = credits;
        }
    }

    pub fn record(&self, identity_id: &str) -> Option<BalanceRecord> {
        self.ledger().accounts.get(identity_id).cloned()
    }

    pub fn usage_log(&self) -> Vec<UsageLogEntry> {
        self.ledger().usage_log.clone()
    }

    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.ledger().fetch_failures.push_back(error);
    }

    pub fn fail_next_deduct(&self, error: RemoteError) {
        self.ledger().deduct_failures.push_back(error);
    }

    pub fn fail_next_suspend(&self, error: RemoteError) {
        self.ledger().suspend_failures.push_back(error);
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BalanceAuthority for MemoryAuthority {
    async fn fetch_balance(&self, identity_id: &str) -> Result<BalanceRecord, RemoteError> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut ledger = self.ledger();
        if let Some(error) = ledger.fetch_failures.pop_front() {
            return Err(error);
        }
        ledger
            .accounts
            .get(identity_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(identity_id.to_string()))
    }

    async fn deduct_and_log(&self, request: &DeductRequest) -> Result<DeductReceipt, RemoteError> {
        self.calls.deduct.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut ledger = self.ledger();
        if let Some(error) = ledger.deduct_failures.pop_front() {
            return Err(error);
        }

        let amount = request.amount as i64;
        let record = ledger
            .accounts
            .get_mut(&request.identity_id)
            .filter(|r| r.record_id == request.record_id)
            .ok_or_else(|| RemoteError::NotFound(request.identity_id.clone()))?;

        if record.credits_left < amount {
            return Err(RemoteError::Rejected(format!(
                "insufficient credits: {} available, {} requested",
                record.credits_left, amount
            )));
        }
        record.credits_left -= amount;
        let remaining = record.credits_left;

        ledger.usage_log.push(UsageLogEntry {
            identity_id: request.identity_id.clone(),
            record_id: request.record_id.clone(),
            amount: request.amount,
            usage_type: request.usage_type.clone(),
            logged_at: Utc::now(),
        });

        Ok(DeductReceipt {
            message: format!("Success: {} credits left", remaining),
        })
    }

    async fn suspend(&self, identity_id: &str) -> Result<(), RemoteError> {
        self.calls.suspend.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut ledger = self.ledger();
        if let Some(error) = ledger.suspend_failures.pop_front() {
            return Err(error);
        }
        let record = ledger
            .accounts
            .get_mut(identity_id)
            .ok_or_else(|| RemoteError::NotFound(identity_id.to_string()))?;
        record.sub_status = SubscriptionStatus::Suspended;
        Ok(())
    }
}
