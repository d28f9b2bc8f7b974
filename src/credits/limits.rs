//! Pre-spend affordability check
//!
//! Lets a caller decide whether to offer an action before calling `spend`.
//! Purely advisory: `spend` applies its own rules and the authority has the
//! final word.

use chrono::{DateTime, Utc};

use super::types::{BalanceSnapshot, DenialReason, SpendCheck, SubscriptionStatus};

/// Check whether `amount` credits could be spent from `snapshot` at `now`
pub fn check_spend(
    snapshot: Option<&BalanceSnapshot>,
    amount: u64,
    now: DateTime<Utc>,
) -> SpendCheck {
    let Some(snapshot) = snapshot else {
        return SpendCheck::Denied {
            reason: DenialReason::NotLoaded,
        };
    };

    if snapshot.status == SubscriptionStatus::Suspended {
        return SpendCheck::Denied {
            reason: DenialReason::SubscriptionInactive {
                status: snapshot.status,
            },
        };
    }

    if !snapshot.plan_covers(now) {
        return SpendCheck::Denied {
            reason: DenialReason::PlanExpired {
                ended_at: snapshot.plan_end_date,
            },
        };
    }

    if snapshot.credits_left < amount {
        return SpendCheck::Denied {
            reason: DenialReason::InsufficientCredits {
                required: amount,
                available: snapshot.credits_left,
            },
        };
    }

    SpendCheck::Allowed {
        remaining: snapshot.credits_left - amount,
    }
}
