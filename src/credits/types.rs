//! Credit data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Administrative state of the subscription backing a balance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Suspended,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Action a caller wants to pay for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// Image generation from a drawing
    Drawing,
    /// Story text generation
    Story,
    /// Narration / speech synthesis
    Voice,
}

impl UsageKind {
    pub const ALL: [UsageKind; 3] = [UsageKind::Drawing, UsageKind::Story, UsageKind::Voice];

    /// Usage type recorded in the remote usage log
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drawing => "drawing",
            Self::Story => "story",
            Self::Voice => "voice",
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credits charged per action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTable {
    costs: HashMap<UsageKind, u64>,
}

impl CostTable {
    /// Cost of one action of the given kind
    pub fn cost_of(&self, kind: UsageKind) -> u64 {
        self.costs.get(&kind).copied().unwrap_or(0)
    }

    /// Override the cost of one kind
    pub fn set_cost(&mut self, kind: UsageKind, cost: u64) {
        self.costs.insert(kind, cost);
    }
}

impl Default for CostTable {
    fn default() -> Self {
        let costs = HashMap::from([
            (UsageKind::Drawing, 25),
            (UsageKind::Story, 25),
            (UsageKind::Voice, 10),
        ]);
        Self { costs }
    }
}

/// One identity's known credit state at a point in time.
///
/// Credits and plan metadata are always replaced together; there is no way to
/// update one column without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub identity_id: String,
    /// Backing subscription row, required for deduct-and-log
    pub record_id: String,
    pub credits_left: u64,
    pub is_active: bool,
    pub plan_type: String,
    pub plan_end_date: DateTime<Utc>,
    pub status: SubscriptionStatus,
}

impl BalanceSnapshot {
    /// Optimistic view after spending `amount` locally.
    ///
    /// Clamps at zero; a zeroed balance is never active.
    pub fn after_spend(&self, amount: u64) -> Self {
        let credits_left = self.credits_left.saturating_sub(amount);
        Self {
            credits_left,
            is_active: credits_left > 0 && self.is_active,
            ..self.clone()
        }
    }

    /// View after the insufficient-credits path suspended the subscription
    pub fn exhausted(&self) -> Self {
        Self {
            credits_left: 0,
            is_active: false,
            status: SubscriptionStatus::Suspended,
            ..self.clone()
        }
    }

    /// Whether the plan window still covers `now`
    pub fn plan_covers(&self, now: DateTime<Utc>) -> bool {
        self.plan_end_date >= now
    }
}

/// Balance row as returned by the authority.
///
/// `is_active` is not transmitted; it is derived when converting into a
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    #[serde(rename = "id")]
    pub record_id: String,
    pub credits_left: i64,
    pub plan_type: String,
    pub plan_end_date: DateTime<Utc>,
    #[serde(rename = "status")]
    pub sub_status: SubscriptionStatus,
}

impl BalanceRecord {
    /// Build a snapshot, clamping negative balances and deriving `is_active`
    pub fn into_snapshot(self, identity_id: &str, now: DateTime<Utc>) -> BalanceSnapshot {
        let credits_left = self.credits_left.max(0) as u64;
        let is_active = self.plan_end_date >= now
            && self.sub_status == SubscriptionStatus::Active
            && credits_left > 0;

        BalanceSnapshot {
            identity_id: identity_id.to_string(),
            record_id: self.record_id,
            credits_left,
            is_active,
            plan_type: self.plan_type,
            plan_end_date: self.plan_end_date,
            status: self.sub_status,
        }
    }
}

/// Arguments for the atomic deduct-and-log call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeductRequest {
    pub identity_id: String,
    pub record_id: String,
    pub amount: u64,
    pub usage_type: String,
}

/// Confirmation of a successful deduct-and-log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeductReceipt {
    /// Message reported by the authority, for logging only
    pub message: String,
}

/// Result of an affordability check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum SpendCheck {
    #[serde(rename = "allowed")]
    Allowed { remaining: u64 },
    #[serde(rename = "denied")]
    Denied { reason: DenialReason },
}

impl SpendCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn denial_reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Denied { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Reason a spend would not be accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum DenialReason {
    /// No snapshot cached yet; the caller should force a refresh
    #[serde(rename = "notLoaded")]
    NotLoaded,
    #[serde(rename = "subscriptionInactive")]
    SubscriptionInactive { status: SubscriptionStatus },
    #[serde(rename = "planExpired")]
    PlanExpired { ended_at: DateTime<Utc> },
    #[serde(rename = "insufficientCredits")]
    InsufficientCredits { required: u64, available: u64 },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "Credit balance has not been loaded yet"),
            Self::SubscriptionInactive { status } => {
                write!(f, "Subscription is {}", status)
            }
            Self::PlanExpired { ended_at } => {
                write!(f, "Plan ended on {}", ended_at.format("%Y-%m-%d"))
            }
            Self::InsufficientCredits {
                required,
                available,
            } => {
                write!(
                    f,
                    "Not enough credits: {} required, {} available",
                    required, available
                )
            }
        }
    }
}
