// Delivery scheduler — the single periodic driver.
//
// One tokio interval, one scan. Housekeeping (subscription nudges, the
// expiry consistency sweep) runs on multiples of the same base tick so the
// whole system has exactly one clock source. Per-user failures are logged
// and never abort the scan of the remaining population.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use dripfeed_core::models::User;
use dripfeed_core::settings::{EVENING_TIME, MORNING_TIME};
use dripfeed_core::store::ReminderKind;
use dripfeed_core::timezone;

use crate::context::EngineContext;
use crate::ports::OutboundMessage;
use crate::progression::{evaluate_access, reminder_due, Access, ProgressionEngine, TriggerKind};

/// Base tick interval.
pub const TICK_INTERVAL_SECS: u64 = 60;

/// Subscription-nudge sweep cadence, in base ticks.
const NUDGE_SWEEP_EVERY: u64 = 10;

/// Expiry consistency sweep cadence, in base ticks.
const EXPIRY_SWEEP_EVERY: u64 = 60;

/// The periodic driver tying timezone resolution, progression decisions,
/// and housekeeping together.
#[derive(Debug)]
pub struct DeliveryScheduler {
    ctx: Arc<EngineContext>,
    progression: ProgressionEngine,
    ticks: AtomicU64,
}

impl DeliveryScheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let progression = ProgressionEngine::new(ctx.clone());
        Self {
            ctx,
            progression,
            ticks: AtomicU64::new(0),
        }
    }

    /// Start the background loop.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("delivery scheduler started");
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));

            loop {
                interval.tick().await;
                let now = self.ctx.clock.now();
                self.tick(now).await;
            }
        })
    }

    /// Execute one tick. Public so tests can drive the scheduler with a
    /// manual clock instead of waiting on the interval.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let tick_no = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let morning_slot = match self.ctx.settings.get(MORNING_TIME).await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "failed to read morning slot; tick skipped");
                return;
            }
        };
        let evening_slot = self.ctx.settings.get(EVENING_TIME).await.unwrap_or(None);

        let users = match self.ctx.store.stream_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "failed to load scan population; tick skipped");
                return;
            }
        };

        debug!(tick = tick_no, users = users.len(), "scan started");
        for user in &users {
            if let Err(e) = self
                .process_user(user, now, morning_slot.as_deref(), evening_slot.as_deref())
                .await
            {
                warn!(user = %user.id, error = %e, "delivery failed; continuing scan");
            }
        }

        if tick_no % NUDGE_SWEEP_EVERY == 0 {
            self.nudge_sweep(now).await;
        }
        if tick_no % EXPIRY_SWEEP_EVERY == 0 {
            self.expiry_sweep(now).await;
        }
    }

    /// Evaluate both slots for one user.
    async fn process_user(
        &self,
        user: &User,
        now: DateTime<Utc>,
        morning_slot: Option<&str>,
        evening_slot: Option<&str>,
    ) -> dripfeed_core::error::Result<()> {
        let local = match timezone::local_hhmm(&user.timezone, now) {
            Ok(local) => local,
            Err(e) => {
                // A broken timezone only breaks its own user.
                warn!(user = %user.id, timezone = %user.timezone, error = %e, "unresolvable timezone");
                return Ok(());
            }
        };
        let window = self.ctx.options.reminder_window();

        // An unset slot disables that slot's delivery entirely, reminders
        // included — it fails open to a no-op, never to a default time.
        if let Some(slot) = morning_slot {
            if local == slot {
                self.progression
                    .run_morning(user, TriggerKind::Regular, now)
                    .await?;
            } else if reminder_due(user.pending_morning_at, now, window) {
                self.progression
                    .run_morning(user, TriggerKind::Reminder, now)
                    .await?;
            }
        }

        if let Some(slot) = evening_slot {
            if local == slot {
                self.progression
                    .run_evening(user, TriggerKind::Regular, now)
                    .await?;
            } else if reminder_due(user.pending_evening_at, now, window) {
                self.progression
                    .run_evening(user, TriggerKind::Reminder, now)
                    .await?;
            }
        }

        Ok(())
    }

    /// Send deferred subscription nudges to users whose nudge timestamp
    /// elapsed and whose subscription is inactive.
    async fn nudge_sweep(&self, now: DateTime<Utc>) {
        let due = match self.ctx.store.nudge_due_users(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "nudge sweep query failed");
                return;
            }
        };

        for user in due {
            if let Err(e) = self
                .ctx
                .sender
                .deliver(&user.id, OutboundMessage::SubscriptionNudge)
                .await
            {
                warn!(user = %user.id, error = %e, "nudge delivery failed");
            }
            // Cleared regardless of delivery outcome — one nudge per request.
            if let Err(e) = self
                .ctx
                .store
                .set_reminder(&user.id, ReminderKind::Nudge, None)
                .await
            {
                warn!(user = %user.id, error = %e, "nudge clear failed");
            }
        }
    }

    /// Latch users whose access ran out between morning slots. Idempotent:
    /// the latch CAS makes the expiry message fire at most once per expiry.
    async fn expiry_sweep(&self, now: DateTime<Utc>) {
        let users = match self.ctx.store.stream_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "expiry sweep query failed");
                return;
            }
        };

        for user in users {
            let sub = match self.ctx.store.find_subscription(&user.id).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(user = %user.id, error = %e, "expiry sweep lookup failed");
                    continue;
                }
            };
            let access = evaluate_access(
                sub.as_ref(),
                user.current_day,
                self.ctx.options.trial_limit,
                now,
            );
            if access != Access::Denied {
                continue;
            }
            match self
                .ctx
                .store
                .latch_expiry(&user.id, self.ctx.options.trial_limit)
                .await
            {
                Ok(true) => {
                    info!(user = %user.id, "expiry sweep latched user");
                    if let Err(e) = self
                        .ctx
                        .sender
                        .deliver(&user.id, OutboundMessage::AccessExpired)
                        .await
                    {
                        warn!(user = %user.id, error = %e, "expiry message delivery failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(user = %user.id, error = %e, "expiry latch failed"),
            }
        }
    }
}
