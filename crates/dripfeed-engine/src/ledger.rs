// Subscription ledger — the single `grant` operation every payment channel
// funnels into.
//
// Idempotency: the journal insert happens before the ledger mutation, so a
// replayed confirmation (same key) short-circuits without re-granting.
// Extension semantics live in the store's atomic upsert: days stack on top
// of a live expiry, or count from now when access has lapsed.

use std::sync::Arc;

use tracing::{info, warn};

use dripfeed_core::error::Result;
use dripfeed_core::models::Subscription;

use crate::context::EngineContext;
use crate::ports::OutboundMessage;

/// Result of applying a grant instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantOutcome {
    /// The ledger was extended.
    Applied {
        subscription: Subscription,
        /// True when this grant also started the paced stream (the "paid
        /// during onboarding" fast path).
        stream_started: bool,
    },
    /// The idempotency key was already recorded — replay, nothing changed.
    AlreadyApplied,
    /// The target user does not exist; nothing was recorded.
    UserNotFound,
}

/// Applies "grant N days" instructions to the canonical ledger.
#[derive(Debug, Clone)]
pub struct SubscriptionLedger {
    ctx: Arc<EngineContext>,
}

impl SubscriptionLedger {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Grant `days` of paid access to `user_id`, exactly once per
    /// `idempotency_key`.
    pub async fn grant(
        &self,
        user_id: &str,
        days: i64,
        idempotency_key: &str,
    ) -> Result<GrantOutcome> {
        let now = self.ctx.clock.now();

        let Some(user) = self.ctx.store.find_user(user_id).await? else {
            warn!(user = %user_id, key = %idempotency_key, "grant for unknown user rejected");
            return Ok(GrantOutcome::UserNotFound);
        };

        if !self
            .ctx
            .store
            .record_payment_event(idempotency_key, now)
            .await?
        {
            info!(user = %user_id, key = %idempotency_key, "replayed payment event; grant skipped");
            return Ok(GrantOutcome::AlreadyApplied);
        }

        let subscription = self.ctx.store.extend_subscription(user_id, days, now).await?;
        info!(
            user = %user_id,
            days,
            paid_until = ?subscription.paid_until,
            "subscription extended"
        );

        // Paid during onboarding: start the paced stream and deliver day 1
        // immediately. The pointer lands on its post-first-content value.
        let mut stream_started = false;
        if user.onboarded && user.stream_started_at.is_none() {
            stream_started = self.ctx.store.start_stream(user_id, now, 2).await?;
            if stream_started {
                info!(user = %user_id, "stream started by payment fast path");
                if let Some(item) = self.ctx.store.content_for_day(1).await? {
                    if let Err(e) = self
                        .ctx
                        .sender
                        .deliver(
                            user_id,
                            OutboundMessage::MorningContent {
                                day: 1,
                                item,
                                redelivery: false,
                            },
                        )
                        .await
                    {
                        warn!(user = %user_id, error = %e, "day-1 fast-path delivery failed");
                    }
                }
            }
        }

        if let Some(paid_until) = subscription.paid_until {
            if let Err(e) = self
                .ctx
                .sender
                .deliver(user_id, OutboundMessage::PaymentConfirmed { paid_until })
                .await
            {
                warn!(user = %user_id, error = %e, "payment confirmation delivery failed");
            }
        }

        Ok(GrantOutcome::Applied {
            subscription,
            stream_started,
        })
    }
}
