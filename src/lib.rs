pub mod config;
pub mod credits;
pub mod error;

pub use config::{QuotaConfig, RestConfig};
pub use credits::{
    BalanceAuthority, BalanceSnapshot, MemoryAuthority, QuotaController, RestAuthority,
    SpendCheck, Subscription, UsageKind,
};
pub use error::{QuotaError, RemoteError, Result};

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the RUST_LOG env filter.
///
/// Default: warn for most crates, info for this one (spends and suspensions
/// visible). Use RUST_LOG=credit_sync=debug for per-read cache decisions.
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,credit_sync=info")),
        )
        .try_init();
}
