// Gift lifecycle — purchase intent, and the one-time redemption that moves
// days onto the recipient's ledger.
//
// The token is the only coupling between purchaser and beneficiary: paying
// for a gift never touches the purchaser's own subscription.

use std::sync::Arc;

use tracing::{info, warn};

use dripfeed_core::error::{DripError, Result};
use dripfeed_core::id::generate_gift_token;
use dripfeed_core::models::{GiftStatus, GiftSubscription};
use dripfeed_core::store::RedeemOutcome;

use crate::context::EngineContext;
use crate::ledger::SubscriptionLedger;

/// Gift purchase and redemption operations.
#[derive(Debug, Clone)]
pub struct GiftService {
    ctx: Arc<EngineContext>,
    ledger: SubscriptionLedger,
}

impl GiftService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let ledger = SubscriptionLedger::new(ctx.clone());
        Self { ctx, ledger }
    }

    /// Record a purchase intent, independent of payment outcome.
    ///
    /// `external` marks gateways with no local checkout step: the gift waits
    /// in `pending_external` until the provider's webhook confirms payment.
    pub async fn create(
        &self,
        purchaser_id: &str,
        plan_id: &str,
        external: bool,
    ) -> Result<GiftSubscription> {
        let plan = self
            .ctx
            .options
            .find_plan(plan_id)
            .ok_or_else(|| DripError::UnknownPlan(plan_id.to_string()))?;

        let gift = GiftSubscription {
            token: generate_gift_token(),
            status: if external {
                GiftStatus::PendingExternal
            } else {
                GiftStatus::Created
            },
            plan_id: plan.id.clone(),
            days: plan.days,
            purchaser_id: purchaser_id.to_string(),
            redeemed_by_user_id: None,
            paid_at: None,
            redeemed_at: None,
            created_at: self.ctx.clock.now(),
        };

        let gift = self.ctx.store.create_gift(gift).await?;
        info!(token = %gift.token, purchaser = %gift.purchaser_id, "gift intent recorded");
        Ok(gift)
    }

    /// Redeem a token for `recipient_id`.
    ///
    /// The paid → redeemed transition is a store-level compare-and-set, so
    /// concurrent attempts on one token yield exactly one success; the
    /// winner's grant uses the token itself as the idempotency key.
    pub async fn redeem(&self, token: &str, recipient_id: &str) -> Result<RedeemOutcome> {
        let now = self.ctx.clock.now();

        // An unknown recipient must not consume the token.
        if self.ctx.store.find_user(recipient_id).await?.is_none() {
            warn!(token = %token, recipient = %recipient_id, "redemption for unknown user rejected");
            return Err(DripError::Store(dripfeed_core::error::StoreError::NotFound(
                format!("user {recipient_id}"),
            )));
        }

        let outcome = self.ctx.store.redeem_gift(token, recipient_id, now).await?;

        match &outcome {
            RedeemOutcome::Redeemed(gift) => {
                info!(token = %token, recipient = %recipient_id, days = gift.days, "gift redeemed");
                self.ledger
                    .grant(recipient_id, gift.days, &format!("gift:{token}"))
                    .await?;
            }
            RedeemOutcome::AlreadyRedeemed => {
                info!(token = %token, recipient = %recipient_id, "redemption lost: already redeemed");
            }
            RedeemOutcome::NotPaid | RedeemOutcome::NotFound => {
                warn!(token = %token, recipient = %recipient_id, outcome = ?outcome, "redemption rejected");
            }
        }

        Ok(outcome)
    }
}
