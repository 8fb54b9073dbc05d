// Onboarding lifecycle — registration through trial activation.
//
// Completing onboarding activates the trial and starts the paced stream:
// day 1 goes out immediately and the pointer lands on 2, so the next
// morning slot delivers day 2. The stream start is the same CAS the payment
// fast path uses, so a payment landing mid-onboarding and the completion
// handler can both try to start the stream and exactly one wins.

use std::sync::Arc;

use tracing::{info, warn};

use dripfeed_core::error::Result;
use dripfeed_core::models::User;

use crate::context::EngineContext;
use crate::ports::OutboundMessage;

/// Registration and onboarding operations.
#[derive(Debug, Clone)]
pub struct OnboardingService {
    ctx: Arc<EngineContext>,
}

impl OnboardingService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Register a user on first contact; a repeat registration returns the
    /// existing record untouched.
    pub async fn register(&self, user_id: &str, timezone: &str) -> Result<User> {
        if let Some(existing) = self.ctx.store.find_user(user_id).await? {
            return Ok(existing);
        }
        let user = User::new(user_id, timezone, self.ctx.clock.now());
        let user = self.ctx.store.create_user(user).await?;
        info!(user = %user.id, "user registered");
        Ok(user)
    }

    /// Store the name chosen during onboarding.
    pub async fn set_name(&self, user_id: &str, name: &str) -> Result<()> {
        self.ctx.store.set_display_name(user_id, name).await?;
        Ok(())
    }

    /// Complete onboarding: activate the trial, start the paced stream, and
    /// deliver day 1 immediately.
    pub async fn complete(&self, user_id: &str) -> Result<()> {
        let now = self.ctx.clock.now();

        self.ctx.store.set_onboarded(user_id, now).await?;
        self.ctx.store.start_trial(user_id, now).await?;

        // The payment fast path races this same CAS; whoever wins delivers
        // day 1.
        if !self.ctx.store.start_stream(user_id, now, 2).await? {
            info!(user = %user_id, "stream already started; onboarding completion is a no-op");
            return Ok(());
        }

        info!(user = %user_id, "onboarding complete; stream started");
        match self.ctx.store.content_for_day(1).await? {
            Some(item) => {
                self.ctx
                    .sender
                    .deliver(
                        user_id,
                        OutboundMessage::MorningContent {
                            day: 1,
                            item,
                            redelivery: false,
                        },
                    )
                    .await?;
            }
            None => warn!(user = %user_id, "no day-1 content to deliver at stream start"),
        }
        Ok(())
    }
}
