// HashMap-backed Store.
//
// All maps live behind one `RwLock`; compare-and-set operations take the
// write lock for their whole read-check-write sequence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use dripfeed_core::error::{StoreError, StoreResult};
use dripfeed_core::models::{ContentItem, GiftStatus, GiftSubscription, Subscription, User};
use dripfeed_core::store::{RedeemOutcome, ReminderKind, Store};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, User>,
    subscriptions: HashMap<String, Subscription>,
    gifts: HashMap<String, GiftSubscription>,
    content: BTreeMap<i64, ContentItem>,
    payment_events: HashMap<String, DateTime<Utc>>,
    settings: HashMap<String, String>,
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded payment-event keys (for tests).
    pub async fn payment_event_count(&self) -> usize {
        self.inner.read().await.payment_events.len()
    }

    /// Clear all data.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }
}

fn fresh_subscription(user_id: &str, now: DateTime<Utc>) -> Subscription {
    Subscription {
        user_id: user_id.to_string(),
        active: false,
        paid_until: None,
        trial_days_used: 0,
        activated_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ─── Users ───────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> StoreResult<User> {
        let mut inner = self.inner.write().await;
        if inner.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} exists", user.id)));
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn stream_users(&self) -> StoreResult<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| u.stream_started_at.is_some())
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn set_display_name(&self, user_id: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.display_name = Some(name.to_string());
        Ok(())
    }

    async fn set_onboarded(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.onboarded = true;
        user.updated_at = now;
        Ok(())
    }

    async fn start_stream(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        next_day: i64,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if user.stream_started_at.is_some() {
            return Ok(false);
        }
        user.stream_started_at = Some(now);
        user.current_day = next_day;
        user.updated_at = now;
        Ok(true)
    }

    async fn advance_day(&self, user_id: &str, from: i64, to: i64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if user.current_day != from {
            return Ok(false);
        }
        user.current_day = to;
        Ok(true)
    }

    async fn set_reminder(
        &self,
        user_id: &str,
        kind: ReminderKind,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        match kind {
            ReminderKind::Morning => user.pending_morning_at = at,
            ReminderKind::Evening => user.pending_evening_at = at,
            ReminderKind::Nudge => user.pending_nudge_at = at,
        }
        Ok(())
    }

    async fn nudge_due_users(&self, now: DateTime<Utc>) -> StoreResult<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| u.pending_nudge_at.map(|t| t <= now).unwrap_or(false))
            .filter(|u| {
                inner
                    .subscriptions
                    .get(&u.id)
                    .map(|s| !s.active)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    // ─── Subscriptions ───────────────────────────────────────────

    async fn find_subscription(&self, user_id: &str) -> StoreResult<Option<Subscription>> {
        Ok(self.inner.read().await.subscriptions.get(user_id).cloned())
    }

    async fn start_trial(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<Subscription> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .entry(user_id.to_string())
            .or_insert_with(|| fresh_subscription(user_id, now));
        sub.active = true;
        sub.activated_at = Some(now);
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn extend_subscription(
        &self,
        user_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .entry(user_id.to_string())
            .or_insert_with(|| fresh_subscription(user_id, now));

        let base = match sub.paid_until {
            Some(until) if until > now => until,
            _ => now,
        };
        sub.paid_until = Some(base + chrono::Duration::days(days));
        sub.active = true;
        if sub.activated_at.is_none() {
            sub.activated_at = Some(now);
        }
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn record_trial_progress(&self, user_id: &str, day: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {user_id}")))?;
        if day > sub.trial_days_used {
            sub.trial_days_used = day;
        }
        Ok(())
    }

    async fn latch_expiry(&self, user_id: &str, trial_floor: i64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(sub) = inner.subscriptions.get_mut(user_id) else {
            return Ok(false);
        };
        if !sub.active {
            return Ok(false);
        }
        sub.active = false;
        if sub.trial_days_used < trial_floor {
            sub.trial_days_used = trial_floor;
        }
        Ok(true)
    }

    // ─── Gifts ───────────────────────────────────────────────────

    async fn create_gift(&self, gift: GiftSubscription) -> StoreResult<GiftSubscription> {
        let mut inner = self.inner.write().await;
        if inner.gifts.contains_key(&gift.token) {
            return Err(StoreError::Conflict(format!("gift {} exists", gift.token)));
        }
        inner.gifts.insert(gift.token.clone(), gift.clone());
        Ok(gift)
    }

    async fn find_gift(&self, token: &str) -> StoreResult<Option<GiftSubscription>> {
        Ok(self.inner.read().await.gifts.get(token).cloned())
    }

    async fn mark_gift_paid(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GiftSubscription>> {
        let mut inner = self.inner.write().await;
        let Some(gift) = inner.gifts.get_mut(token) else {
            return Ok(None);
        };
        match gift.status {
            GiftStatus::Created | GiftStatus::PendingExternal => {
                gift.status = GiftStatus::Paid;
                gift.paid_at = Some(now);
                Ok(Some(gift.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn redeem_gift(
        &self,
        token: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RedeemOutcome> {
        let mut inner = self.inner.write().await;
        let Some(gift) = inner.gifts.get_mut(token) else {
            return Ok(RedeemOutcome::NotFound);
        };
        match gift.status {
            GiftStatus::Redeemed => Ok(RedeemOutcome::AlreadyRedeemed),
            GiftStatus::Created | GiftStatus::PendingExternal => Ok(RedeemOutcome::NotPaid),
            GiftStatus::Paid => {
                gift.status = GiftStatus::Redeemed;
                gift.redeemed_at = Some(now);
                gift.redeemed_by_user_id = Some(recipient_id.to_string());
                Ok(RedeemOutcome::Redeemed(gift.clone()))
            }
        }
    }

    async fn latest_pending_external_gift(
        &self,
        purchaser_id: &str,
    ) -> StoreResult<Option<GiftSubscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .gifts
            .values()
            .filter(|g| g.purchaser_id == purchaser_id && g.status == GiftStatus::PendingExternal)
            .max_by_key(|g| g.created_at)
            .cloned())
    }

    // ─── Idempotency journal ─────────────────────────────────────

    async fn record_payment_event(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.payment_events.contains_key(key) {
            return Ok(false);
        }
        inner.payment_events.insert(key.to_string(), now);
        Ok(true)
    }

    // ─── Content ─────────────────────────────────────────────────

    async fn put_content(&self, item: ContentItem) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.content.insert(item.day, item);
        Ok(())
    }

    async fn content_for_day(&self, day: i64) -> StoreResult<Option<ContentItem>> {
        Ok(self.inner.read().await.content.get(&day).cloned())
    }

    async fn content_len(&self) -> StoreResult<i64> {
        Ok(self.inner.read().await.content.len() as i64)
    }

    // ─── Settings ────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
