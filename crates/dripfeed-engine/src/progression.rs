// Progression engine — decides what content a user receives and whether
// access is permitted, then applies the decision.
//
// The access rules and pointer arithmetic are pure functions; the engine
// methods add the store side effects. Delivery of a regular morning slot is
// guarded twice: a per-(user, local-date) claim in the idempotency journal
// (so a restart within the matching minute cannot double-send), then a
// compare-and-set pointer advance (so the pointer moves at most one step per
// delivered day). The send happens only after both guards pass — a crash in
// between costs at most one delivery, never a duplicate.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use dripfeed_core::error::Result;
use dripfeed_core::models::{ContentItem, Subscription, User};
use dripfeed_core::store::ReminderKind;
use dripfeed_core::timezone;

use crate::context::EngineContext;
use crate::ports::OutboundMessage;

/// What woke the engine up for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The user's local time matched the configured slot.
    Regular,
    /// A deferred-reminder timestamp elapsed within the catch-up window.
    Reminder,
}

/// Access tier for a given target day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Paid,
    Trial,
    Denied,
}

/// Evaluate access to content day `target`.
///
/// Paid access needs an active subscription with a future expiry. Trial
/// access needs an active subscription, no live paid expiry, and a target
/// within the trial window. Everything else is denied — including day 8+ for
/// a user whose `active` flag is still set.
pub fn evaluate_access(
    sub: Option<&Subscription>,
    target: i64,
    trial_limit: i64,
    now: DateTime<Utc>,
) -> Access {
    let Some(sub) = sub else {
        return Access::Denied;
    };
    if sub.paid_active(now) {
        return Access::Paid;
    }
    if sub.active && target <= trial_limit {
        return Access::Trial;
    }
    Access::Denied
}

/// The pointer value after delivering `target`: `target + 1`, wrapping back
/// to 1 past the end of the content sequence.
pub fn next_pointer(target: i64, content_len: i64) -> i64 {
    if content_len <= 0 {
        return 1;
    }
    let next = target + 1;
    if next > content_len {
        1
    } else {
        next
    }
}

/// The content day a reminder redelivers: the day last sent.
pub fn redelivery_day(current_day: i64) -> i64 {
    (current_day - 1).max(1)
}

/// Whether a deferred timestamp is due: elapsed, but within the catch-up
/// window. Bounding the window keeps a restarted process from replaying
/// every reminder that elapsed while it was down.
pub fn reminder_due(
    pending: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    match pending {
        Some(at) => at <= now && now - at < window,
        None => false,
    }
}

/// Drives per-user content decisions.
#[derive(Debug, Clone)]
pub struct ProgressionEngine {
    ctx: Arc<EngineContext>,
}

impl ProgressionEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Fetch content for `day`, wrapping to day 1 when the sequence is
    /// exhausted. Returns the effective day alongside the item.
    async fn content_with_wrap(&self, day: i64) -> Result<Option<(i64, ContentItem)>> {
        if let Some(item) = self.ctx.store.content_for_day(day).await? {
            return Ok(Some((day, item)));
        }
        // Sequence exhausted — wrap to the beginning.
        Ok(self.ctx.store.content_for_day(1).await?.map(|item| (1, item)))
    }

    /// Handle a morning trigger for one user. `now` is the scheduler tick's
    /// instant, so one tick sees one time.
    pub async fn run_morning(
        &self,
        user: &User,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match trigger {
            TriggerKind::Regular => self.morning_regular(user, now).await,
            TriggerKind::Reminder => self.morning_reminder(user).await,
        }
    }

    async fn morning_regular(&self, user: &User, now: DateTime<Utc>) -> Result<()> {
        let target = user.current_day;

        // Day 1 goes out the moment the stream starts; the first slot
        // delivery is the next local day.
        if let Some(started) = user.stream_started_at {
            let today = timezone::local_date(&user.timezone, now)?;
            if timezone::local_date(&user.timezone, started)? == today {
                debug!(user = %user.id, "stream started today; morning slot skipped");
                return Ok(());
            }
        }

        let sub = self.ctx.store.find_subscription(&user.id).await?;
        let access = evaluate_access(sub.as_ref(), target, self.ctx.options.trial_limit, now);

        if access == Access::Denied {
            // One-way latch: only the caller that flips `active` sends the
            // expiry message; later ticks stay silent.
            if self
                .ctx
                .store
                .latch_expiry(&user.id, self.ctx.options.trial_limit)
                .await?
            {
                info!(user = %user.id, day = target, "access expired; latched");
                self.ctx
                    .sender
                    .deliver(&user.id, OutboundMessage::AccessExpired)
                    .await?;
            }
            return Ok(());
        }

        let Some((effective_day, item)) = self.content_with_wrap(target).await? else {
            warn!(user = %user.id, day = target, "no content available");
            return Ok(());
        };

        // Guard one: a single regular delivery per local calendar day.
        let date = timezone::local_date(&user.timezone, now)?;
        let claim = format!("morning:{}:{}", user.id, date);
        if !self.ctx.store.record_payment_event(&claim, now).await? {
            debug!(user = %user.id, %date, "morning already delivered today");
            return Ok(());
        }

        // Guard two: advance the pointer before sending. Losing the CAS
        // means another worker took this day.
        let content_len = self.ctx.store.content_len().await?;
        let next = next_pointer(target, content_len);
        if !self.ctx.store.advance_day(&user.id, target, next).await? {
            debug!(user = %user.id, day = target, "pointer moved concurrently; skipping");
            return Ok(());
        }

        if target <= self.ctx.options.trial_limit {
            self.ctx.store.record_trial_progress(&user.id, target).await?;
        }

        info!(user = %user.id, day = effective_day, "morning content delivered");
        self.ctx
            .sender
            .deliver(
                &user.id,
                OutboundMessage::MorningContent {
                    day: effective_day,
                    item,
                    redelivery: false,
                },
            )
            .await
    }

    async fn morning_reminder(&self, user: &User) -> Result<()> {
        let day = redelivery_day(user.current_day);

        let result = match self.content_with_wrap(day).await? {
            Some((effective_day, item)) => {
                self.ctx
                    .sender
                    .deliver(
                        &user.id,
                        OutboundMessage::MorningContent {
                            day: effective_day,
                            item,
                            redelivery: true,
                        },
                    )
                    .await
            }
            None => Ok(()),
        };

        // Clear unconditionally, success or failure, so a failing transport
        // cannot turn one deferred reminder into a resend storm.
        self.ctx
            .store
            .set_reminder(&user.id, ReminderKind::Morning, None)
            .await?;
        result
    }

    /// Handle an evening trigger. Never advances state: gates on whether the
    /// next day to be delivered is within bounds, and its only side effect
    /// is clearing its own reminder timestamp.
    pub async fn run_evening(
        &self,
        user: &User,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = async {
            let sub = self.ctx.store.find_subscription(&user.id).await?;
            let access = evaluate_access(
                sub.as_ref(),
                user.current_day,
                self.ctx.options.trial_limit,
                now,
            );
            if access == Access::Denied {
                // Evenings stay silent after expiry; the morning pass owns
                // the expiry messaging.
                return Ok(());
            }
            self.ctx
                .sender
                .deliver(
                    &user.id,
                    OutboundMessage::EveningPrompt {
                        day: redelivery_day(user.current_day),
                    },
                )
                .await
        }
        .await;

        if trigger == TriggerKind::Reminder {
            self.ctx
                .store
                .set_reminder(&user.id, ReminderKind::Evening, None)
                .await?;
        }
        result
    }

    /// "Remind me later": defer the morning redelivery by two hours.
    pub async fn defer_morning(&self, user_id: &str) -> Result<()> {
        let at = self.ctx.clock.now() + Duration::hours(2);
        self.ctx
            .store
            .set_reminder(user_id, ReminderKind::Morning, Some(at))
            .await?;
        Ok(())
    }

    /// Defer the evening prompt by two hours.
    pub async fn defer_evening(&self, user_id: &str) -> Result<()> {
        let at = self.ctx.clock.now() + Duration::hours(2);
        self.ctx
            .store
            .set_reminder(user_id, ReminderKind::Evening, Some(at))
            .await?;
        Ok(())
    }

    /// Schedule the subscription nudge two days out.
    pub async fn schedule_nudge(&self, user_id: &str) -> Result<()> {
        let at = self.ctx.clock.now() + Duration::days(2);
        self.ctx
            .store
            .set_reminder(user_id, ReminderKind::Nudge, Some(at))
            .await?;
        Ok(())
    }
}
