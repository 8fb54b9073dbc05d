// Payment reconciler — applies verified, canonical gateway events to the
// ledger and the gift store.
//
// By the time an event reaches `apply`, its gateway has already verified the
// payload signature and mapped the provider schema into `GatewayEvent`. The
// reconciler only decides *what the event means*: extend a ledger, or flip a
// gift to paid and hand the purchaser the redemption link.

use std::sync::Arc;

use tracing::{info, warn};

use dripfeed_core::error::Result;
use dripfeed_core::event::GatewayEvent;

use crate::context::EngineContext;
use crate::ledger::{GrantOutcome, SubscriptionLedger};
use crate::ports::OutboundMessage;

/// Result of reconciling one gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Days were granted to a user's ledger.
    Granted,
    /// A gift moved to `paid`; the redemption link went to the purchaser.
    GiftMarkedPaid,
    /// Duplicate confirmation — nothing changed. Acknowledged so the
    /// provider stops retrying.
    Replayed,
    /// Data error (unknown user or token) — rejected with no side effects.
    Rejected,
}

/// Merges asynchronous payment confirmations into the canonical per-user
/// ledger.
#[derive(Debug, Clone)]
pub struct PaymentReconciler {
    ctx: Arc<EngineContext>,
    ledger: SubscriptionLedger,
}

impl PaymentReconciler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let ledger = SubscriptionLedger::new(ctx.clone());
        Self { ctx, ledger }
    }

    /// Apply one canonical event.
    pub async fn apply(&self, event: GatewayEvent) -> Result<ReconcileOutcome> {
        match event {
            GatewayEvent::SubscriptionGrant {
                user_id,
                days,
                idempotency_key,
            } => match self.ledger.grant(&user_id, days, &idempotency_key).await? {
                GrantOutcome::Applied { .. } => Ok(ReconcileOutcome::Granted),
                GrantOutcome::AlreadyApplied => Ok(ReconcileOutcome::Replayed),
                GrantOutcome::UserNotFound => Ok(ReconcileOutcome::Rejected),
            },
            GatewayEvent::GiftPurchase {
                token,
                idempotency_key,
            } => self.gift_paid(&token, &idempotency_key).await,
        }
    }

    /// A gift purchase was confirmed. The gift's forward-only status is the
    /// idempotency guard here: a replayed confirmation finds the gift
    /// already `paid` and no-ops.
    async fn gift_paid(&self, token: &str, idempotency_key: &str) -> Result<ReconcileOutcome> {
        let now = self.ctx.clock.now();

        let Some(gift) = self.ctx.store.mark_gift_paid(token, now).await? else {
            return match self.ctx.store.find_gift(token).await? {
                Some(_) => {
                    info!(token = %token, key = %idempotency_key, "gift already paid; replay ignored");
                    Ok(ReconcileOutcome::Replayed)
                }
                None => {
                    warn!(token = %token, key = %idempotency_key, "payment for unknown gift rejected");
                    Ok(ReconcileOutcome::Rejected)
                }
            };
        };

        info!(token = %token, purchaser = %gift.purchaser_id, "gift paid");
        let link = self.ctx.options.gift_link(token);
        if let Err(e) = self
            .ctx
            .sender
            .deliver(
                &gift.purchaser_id,
                OutboundMessage::GiftReady {
                    token: token.to_string(),
                    days: gift.days,
                    link,
                },
            )
            .await
        {
            warn!(token = %token, error = %e, "gift-ready delivery failed");
        }

        Ok(ReconcileOutcome::GiftMarkedPaid)
    }

    /// Resolve an external-subscription confirmation into a canonical event.
    ///
    /// External providers have no local checkout step, so a payment from a
    /// purchaser with a gift still waiting on confirmation is that gift's
    /// payment; anything else extends the payer's own ledger.
    pub async fn resolve_external(
        &self,
        user_id: &str,
        days: i64,
        idempotency_key: &str,
    ) -> Result<GatewayEvent> {
        if let Some(gift) = self
            .ctx
            .store
            .latest_pending_external_gift(user_id)
            .await?
        {
            return Ok(GatewayEvent::GiftPurchase {
                token: gift.token,
                idempotency_key: idempotency_key.to_string(),
            });
        }
        Ok(GatewayEvent::SubscriptionGrant {
            user_id: user_id.to_string(),
            days,
            idempotency_key: idempotency_key.to_string(),
        })
    }
}
