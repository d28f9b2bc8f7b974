//! Credit balance cache and synchronization
//!
//! This module handles:
//! - Process-wide balance cache with fresh/stale windows
//! - Optimistic spends with confirm-or-rollback against the authority
//! - Debounced, deduplicated refreshes per identity
//! - Fan-out of balance changes to every observer

mod broadcast;
mod controller;
mod limits;
mod memory;
mod refresh;
mod remote;
mod rest;
mod store;
mod types;


pub use broadcast::{Listener, Subscription, UpdateBroadcaster};
pub use controller::QuotaController;
pub use limits::check_spend;
pub use memory::{CallCounts, MemoryAuthority, UsageLogEntry};
pub use refresh::{RefreshCoordinator, RefreshOutcome, RefreshWaiter};
pub use remote::{BalanceAuthority, DynBalanceAuthority};
pub use rest::RestAuthority;
pub use store::{CacheEntry, CacheStore, Freshness};
pub use types::{
    BalanceRecord, BalanceSnapshot, CostTable, DeductReceipt, DeductRequest, DenialReason,
    SpendCheck, SubscriptionStatus, UsageKind,
};
