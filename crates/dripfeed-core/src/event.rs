// The canonical payment event.
//
// Every gateway maps its untrusted wire payload into this tagged variant
// before anything reaches the ledger, isolating the engine from per-provider
// schema churn.

use serde::{Deserialize, Serialize};

/// A verified, provider-agnostic payment instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Grant `days` of paid access to `user_id`.
    SubscriptionGrant {
        user_id: String,
        days: i64,
        /// Provider-scoped key that makes replays of the same confirmed
        /// payment a no-op.
        idempotency_key: String,
    },
    /// A gift purchase was confirmed; the purchaser's own ledger stays
    /// untouched until someone redeems the token.
    GiftPurchase {
        token: String,
        idempotency_key: String,
    },
}

impl GatewayEvent {
    pub fn idempotency_key(&self) -> &str {
        match self {
            Self::SubscriptionGrant {
                idempotency_key, ..
            } => idempotency_key,
            Self::GiftPurchase {
                idempotency_key, ..
            } => idempotency_key,
        }
    }
}
