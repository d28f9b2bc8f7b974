//! Boundary to the service that owns the real balances
//!
//! Adapters translate whatever the backend speaks into these typed results.
//! The engine never inspects message strings; a payload-level failure must
//! come back as `Err(RemoteError::Rejected(..))`.

use async_trait::async_trait;
use std::sync::Arc;

use super::types::{BalanceRecord, DeductReceipt, DeductRequest};
use crate::error::RemoteError;

/// Source of truth for credit balances
#[async_trait]
pub trait BalanceAuthority: Send + Sync {
    /// Plain read of the identity's balance row
    async fn fetch_balance(&self, identity_id: &str) -> Result<BalanceRecord, RemoteError>;

    /// Atomically decrement the balance and append a usage-log row.
    ///
    /// Either both happen or neither does.
    async fn deduct_and_log(&self, request: &DeductRequest) -> Result<DeductReceipt, RemoteError>;

    /// Flip the subscription to suspended. Idempotent.
    async fn suspend(&self, identity_id: &str) -> Result<(), RemoteError>;
}

pub type DynBalanceAuthority = Arc<dyn BalanceAuthority>;
