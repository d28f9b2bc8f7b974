use std::sync::Arc;

use credit_sync::credits::DynBalanceAuthority;
use credit_sync::{
    init_tracing, MemoryAuthority, QuotaConfig, QuotaController, RestAuthority, RestConfig,
    UsageKind,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = QuotaConfig::from_env()?;

    info!("credit-sync v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Windows: fresh {:?}, stale {:?}, debounce {:?}",
        config.fresh_window, config.stale_window, config.debounce_delay
    );

    let identity = std::env::args().nth(1).unwrap_or_else(|| "demo-user".to_string());

    // Talk to the real authority when configured, otherwise a seeded local one
    let authority: DynBalanceAuthority = match RestConfig::from_env() {
        Some(rest) => {
            info!("Using REST authority at {}", rest.base_url);
            Arc::new(RestAuthority::new(rest))
        }
        None => {
            info!("SUPABASE_URL not set, using in-memory authority");
            let memory = MemoryAuthority::new();
            memory.open_account(&identity, 30, 30);
            Arc::new(memory)
        }
    };

    let controller = QuotaController::new(authority, config);
    let _subscription = controller.subscribe(&identity, |snapshot| {
        info!(
            credits_left = snapshot.credits_left,
            active = snapshot.is_active,
            "Balance changed"
        );
    });

    let Some(snapshot) = controller.load_balance(&identity).await? else {
        info!("No balance available for {}", identity);
        return Ok(());
    };
    info!("Loaded {} credits ({} plan)", snapshot.credits_left, snapshot.plan_type);

    for attempt in 1..=2 {
        let cost = controller.config().costs.cost_of(UsageKind::Drawing);
        let check = controller.check_spend(&identity, cost);
        if let Some(reason) = check.denial_reason() {
            info!("Attempt {}: {}", attempt, reason);
        }
        let accepted = controller.spend_for(&identity, UsageKind::Drawing).await?;
        info!("Attempt {}: drawing spend accepted = {}", attempt, accepted);
    }

    controller.sign_out(&identity);
    Ok(())
}
