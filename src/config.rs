//! Engine configuration
//!
//! Defaults match the production constants. `from_env` lets a deployment
//! override them through environment variables or a `.env` file.

use std::time::Duration;

use crate::credits::{CostTable, UsageKind};
use crate::error::{QuotaError, Result};

/// Timing and pricing knobs for the credit engine
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaConfig {
    /// Reads within this window are served with no network activity
    pub fresh_window: Duration,
    /// Reads within this window are served and revalidated in the background
    pub stale_window: Duration,
    /// Quiet period that collapses bursts of refresh requests
    pub debounce_delay: Duration,
    /// Delay before reconciling the cache after a confirmed spend
    pub reconcile_delay: Duration,
    pub costs: CostTable,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            fresh_window: Duration::from_secs(3 * 60),
            stale_window: Duration::from_secs(8 * 60),
            debounce_delay: Duration::from_millis(500),
            reconcile_delay: Duration::from_secs(1),
            costs: CostTable::default(),
        }
    }
}

impl QuotaConfig {
    /// Load overrides from the environment (after reading `.env`)
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var(&lookup, "CREDIT_SYNC_FRESH_SECS")? {
            config.fresh_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "CREDIT_SYNC_STALE_SECS")? {
            config.stale_window = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&lookup, "CREDIT_SYNC_DEBOUNCE_MS")? {
            config.debounce_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CREDIT_SYNC_RECONCILE_MS")? {
            config.reconcile_delay = Duration::from_millis(ms);
        }
        for kind in UsageKind::ALL {
            let key = format!("CREDIT_SYNC_COST_{}", kind.as_str().to_uppercase());
            if let Some(cost) = parse_var(&lookup, &key)? {
                config.costs.set_cost(kind, cost);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stale_window <= self.fresh_window {
            return Err(QuotaError::Config(format!(
                "stale window ({:?}) must be longer than fresh window ({:?})",
                self.stale_window, self.fresh_window
            )));
        }
        for kind in UsageKind::ALL {
            if self.costs.cost_of(kind) == 0 {
                return Err(QuotaError::Config(format!(
                    "cost of {} must be at least one credit",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Connection settings for the PostgREST authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
}

impl RestConfig {
    /// Read `SUPABASE_URL` and `SUPABASE_ANON_KEY`; `None` if either is unset
    pub fn from_env() -> Option<Self> {
        load_dotenv();
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let api_key = std::env::var("SUPABASE_ANON_KEY").ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

fn load_dotenv() {
    // Current dir first, then the parent (running from a subdirectory)
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| QuotaError::Config(format!("{} = {:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QuotaConfig::default();
        assert_eq!(config.fresh_window, Duration::from_secs(180));
        assert_eq!(config.stale_window, Duration::from_secs(480));
        assert_eq!(config.debounce_delay, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = QuotaConfig::from_lookup(lookup(&[
            ("CREDIT_SYNC_FRESH_SECS", "60"),
            ("CREDIT_SYNC_STALE_SECS", "120"),
            ("CREDIT_SYNC_COST_VOICE", "3"),
        ]))
        .unwrap();

        assert_eq!(config.fresh_window, Duration::from_secs(60));
        assert_eq!(config.stale_window, Duration::from_secs(120));
        assert_eq!(config.costs.cost_of(UsageKind::Voice), 3);
        assert_eq!(config.costs.cost_of(UsageKind::Drawing), 25);
    }

    #[test]
    fn test_invalid_number() {
        let err = QuotaConfig::from_lookup(lookup(&[("CREDIT_SYNC_DEBOUNCE_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_stale_must_exceed_fresh() {
        let err = QuotaConfig::from_lookup(lookup(&[("CREDIT_SYNC_STALE_SECS", "60")]))
            .unwrap_err();
        assert!(err.to_string().contains("stale window"));
    }

    #[test]
    fn test_zero_cost_rejected() {
        let err = QuotaConfig::from_lookup(lookup(&[("CREDIT_SYNC_COST_VOICE", "0")]))
            .unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
        assert!(err.to_string().contains("voice"));

        let mut config = QuotaConfig::default();
        config.costs.set_cost(UsageKind::Story, 0);
        assert!(config.validate().is_err());
    }
}
