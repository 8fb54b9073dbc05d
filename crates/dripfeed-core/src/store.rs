// The storage port — the single abstraction every backend implements.
//
// Reconciliation can originate from multiple concurrent request handlers
// while the scheduler scans the same rows, so every racy mutation here is a
// single atomic upsert or compare-and-set *inside the implementation*
// (one write lock in memory, one guarded SQL statement in sqlx). There is
// deliberately no cross-user locking: per-user state is independent.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::models::{ContentItem, GiftSubscription, Subscription, User};

/// Which deferred timestamp a reminder operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    Morning,
    Evening,
    /// Subscription nudge ("remind me in two days").
    Nudge,
}

/// Outcome of a gift redemption attempt. Concurrent attempts on one token
/// yield exactly one `Redeemed`; all others observe `AlreadyRedeemed`.
#[derive(Debug, Clone, PartialEq)]
pub enum RedeemOutcome {
    Redeemed(GiftSubscription),
    AlreadyRedeemed,
    NotPaid,
    NotFound,
}

#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    // ─── Users ───────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> StoreResult<User>;

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;

    /// All users whose paced stream has started. This is the scan population;
    /// users with `stream_started_at == None` never reach the engine.
    async fn stream_users(&self) -> StoreResult<Vec<User>>;

    async fn set_display_name(&self, user_id: &str, name: &str) -> StoreResult<()>;

    async fn set_onboarded(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<()>;

    /// Begin the paced stream: set `stream_started_at = now` and move the
    /// pointer to `next_day` in one step. Returns false if the stream had
    /// already started (CAS on `stream_started_at IS NULL`).
    async fn start_stream(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        next_day: i64,
    ) -> StoreResult<bool>;

    /// Advance the content pointer `from -> to`. Returns false if the pointer
    /// was no longer at `from` (someone else advanced it first).
    async fn advance_day(&self, user_id: &str, from: i64, to: i64) -> StoreResult<bool>;

    /// Set or clear a deferred-reminder timestamp.
    async fn set_reminder(
        &self,
        user_id: &str,
        kind: ReminderKind,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Users whose subscription nudge has elapsed and whose subscription is
    /// inactive.
    async fn nudge_due_users(&self, now: DateTime<Utc>) -> StoreResult<Vec<User>>;

    // ─── Subscriptions ───────────────────────────────────────────

    async fn find_subscription(&self, user_id: &str) -> StoreResult<Option<Subscription>>;

    /// Activate the trial: upsert the subscription with `active = true`,
    /// preserving any existing trial counter.
    async fn start_trial(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<Subscription>;

    /// Extend paid access by `days`, counting from `max(paid_until, now)`,
    /// and set `active = true`. Creates the row if absent. Atomic with
    /// respect to concurrent extensions — two grants of N days each always
    /// total 2N.
    async fn extend_subscription(
        &self,
        user_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription>;

    /// Record that content day `day` was consumed on trial. Monotonic: the
    /// stored counter never decreases.
    async fn record_trial_progress(&self, user_id: &str, day: i64) -> StoreResult<()>;

    /// The expiry latch: flip `active` from true to false exactly once,
    /// raising `trial_days_used` to at least `trial_floor`. Returns true only
    /// for the caller that performed the flip, so the expiry message fires at
    /// most once per expiry — never once per tick.
    async fn latch_expiry(&self, user_id: &str, trial_floor: i64) -> StoreResult<bool>;

    // ─── Gifts ───────────────────────────────────────────────────

    async fn create_gift(&self, gift: GiftSubscription) -> StoreResult<GiftSubscription>;

    async fn find_gift(&self, token: &str) -> StoreResult<Option<GiftSubscription>>;

    /// Move a gift from `created`/`pending_external` to `paid`. Returns
    /// `None` if the gift is unknown or already past that transition
    /// (replayed confirmation).
    async fn mark_gift_paid(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GiftSubscription>>;

    /// Move a gift from `paid` to `redeemed`, recording the recipient, as
    /// one atomic step.
    async fn redeem_gift(
        &self,
        token: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RedeemOutcome>;

    /// The purchaser's most recent gift still waiting on an external payment
    /// confirmation.
    async fn latest_pending_external_gift(
        &self,
        purchaser_id: &str,
    ) -> StoreResult<Option<GiftSubscription>>;

    // ─── Idempotency journal ─────────────────────────────────────

    /// Record a processed payment-event key. Returns true when the key is
    /// fresh; false when it was already recorded (unique insert). This is
    /// both the reconciler's replay guard and the per-(user, day) delivery
    /// guard.
    async fn record_payment_event(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    // ─── Content ─────────────────────────────────────────────────

    async fn put_content(&self, item: ContentItem) -> StoreResult<()>;

    /// Content for a given day. Absence signals sequence exhaustion — a
    /// normal wraparound condition, never an error.
    async fn content_for_day(&self, day: i64) -> StoreResult<Option<ContentItem>>;

    /// Length of the dense content sequence.
    async fn content_len(&self) -> StoreResult<i64>;

    // ─── Settings ────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}
