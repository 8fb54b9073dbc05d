// SqlxStore — the SQL implementation of the core Store trait.
//
// Compare-and-set operations are single statements judged by affected rows;
// the one read-modify-write (paid-expiry extension) is an optimistic CAS
// loop guarded on the previous expiry value, so concurrent grants from
// independent request handlers always stack instead of overwriting.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::debug;

use dripfeed_core::error::{StoreError, StoreResult};
use dripfeed_core::models::{ContentItem, GiftStatus, GiftSubscription, Subscription, User};
use dripfeed_core::store::{RedeemOutcome, ReminderKind, Store};

use crate::schema;

/// Max optimistic retries for the expiry-extension CAS loop.
const EXTEND_RETRIES: usize = 5;

/// SQLx-backed store.
#[derive(Debug, Clone)]
pub struct SqlxStore {
    pool: AnyPool,
}

impl SqlxStore {
    /// Wrap an existing pool.
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and apply the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();

        // Each connection to "sqlite::memory:" is its own database, so the
        // in-memory pool must stay at one connection.
        let pool = if url.contains(":memory:") || url.contains("mode=memory") {
            sqlx::any::AnyPoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
        } else {
            AnyPool::connect(url).await
        }
        .map_err(|e| StoreError::Backend(format!("database connection failed: {e}")))?;

        let store = Self { pool };
        schema::migrate(&store.pool).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

// ─── Encoding helpers ────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    // Fixed-width UTC so TEXT comparison orders chronologically.
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode_err(e: sqlx::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("unique") || msg.contains("duplicate")
}

// ─── Row mapping ─────────────────────────────────────────────────

fn user_from_row(row: &AnyRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id").map_err(decode_err)?,
        timezone: row.try_get("timezone").map_err(decode_err)?,
        current_day: row.try_get("current_day").map_err(decode_err)?,
        stream_started_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("stream_started_at")
                .map_err(decode_err)?,
        )?,
        onboarded: row.try_get::<i64, _>("onboarded").map_err(decode_err)? != 0,
        display_name: row
            .try_get::<Option<String>, _>("display_name")
            .map_err(decode_err)?,
        pending_morning_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("pending_morning_at")
                .map_err(decode_err)?,
        )?,
        pending_evening_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("pending_evening_at")
                .map_err(decode_err)?,
        )?,
        pending_nudge_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("pending_nudge_at")
                .map_err(decode_err)?,
        )?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(decode_err)?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(decode_err)?)?,
    })
}

fn subscription_from_row(row: &AnyRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        user_id: row.try_get("user_id").map_err(decode_err)?,
        active: row.try_get::<i64, _>("active").map_err(decode_err)? != 0,
        paid_until: parse_opt_ts(
            row.try_get::<Option<String>, _>("paid_until")
                .map_err(decode_err)?,
        )?,
        trial_days_used: row.try_get("trial_days_used").map_err(decode_err)?,
        activated_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("activated_at")
                .map_err(decode_err)?,
        )?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(decode_err)?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(decode_err)?)?,
    })
}

fn gift_from_row(row: &AnyRow) -> StoreResult<GiftSubscription> {
    let status_raw: String = row.try_get("status").map_err(decode_err)?;
    let status = GiftStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("bad gift status {status_raw:?}")))?;
    Ok(GiftSubscription {
        token: row.try_get("token").map_err(decode_err)?,
        status,
        plan_id: row.try_get("plan_id").map_err(decode_err)?,
        days: row.try_get("days").map_err(decode_err)?,
        purchaser_id: row.try_get("purchaser_id").map_err(decode_err)?,
        redeemed_by_user_id: row
            .try_get::<Option<String>, _>("redeemed_by_user_id")
            .map_err(decode_err)?,
        paid_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("paid_at")
                .map_err(decode_err)?,
        )?,
        redeemed_at: parse_opt_ts(
            row.try_get::<Option<String>, _>("redeemed_at")
                .map_err(decode_err)?,
        )?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(decode_err)?)?,
    })
}

fn content_from_row(row: &AnyRow) -> StoreResult<ContentItem> {
    Ok(ContentItem {
        day: row.try_get("day").map_err(decode_err)?,
        title: row.try_get("title").map_err(decode_err)?,
        declaration: row.try_get("declaration").map_err(decode_err)?,
        body: row.try_get("body").map_err(decode_err)?,
        exercise: row.try_get("exercise").map_err(decode_err)?,
    })
}

fn reminder_column(kind: ReminderKind) -> &'static str {
    match kind {
        ReminderKind::Morning => "pending_morning_at",
        ReminderKind::Evening => "pending_evening_at",
        ReminderKind::Nudge => "pending_nudge_at",
    }
}

#[async_trait]
impl Store for SqlxStore {
    // ─── Users ───────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> StoreResult<User> {
        let result = sqlx::query(
            "INSERT INTO drip_user \
             (id, timezone, current_day, stream_started_at, onboarded, display_name, \
              pending_morning_at, pending_evening_at, pending_nudge_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&user.id)
        .bind(&user.timezone)
        .bind(user.current_day)
        .bind(opt_ts(user.stream_started_at))
        .bind(user.onboarded as i64)
        .bind(&user.display_name)
        .bind(opt_ts(user.pending_morning_at))
        .bind(opt_ts(user.pending_evening_at))
        .bind(opt_ts(user.pending_nudge_at))
        .bind(ts(user.created_at))
        .bind(ts(user.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(user),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Conflict(format!("user {} exists", user.id)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        sqlx::query("SELECT * FROM drip_user WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn stream_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT * FROM drip_user WHERE stream_started_at IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn set_display_name(&self, user_id: &str, name: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE drip_user SET display_name = $1 WHERE id = $2")
            .bind(name)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn set_onboarded(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE drip_user SET onboarded = 1, updated_at = $1 WHERE id = $2")
                .bind(ts(now))
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn start_stream(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        next_day: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE drip_user \
             SET stream_started_at = $1, current_day = $2, updated_at = $1 \
             WHERE id = $3 AND stream_started_at IS NULL",
        )
        .bind(ts(now))
        .bind(next_day)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Lost CAS, or the user does not exist at all.
        if self.find_user(user_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(false)
    }

    async fn advance_day(&self, user_id: &str, from: i64, to: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE drip_user SET current_day = $1 WHERE id = $2 AND current_day = $3",
        )
        .bind(to)
        .bind(user_id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.find_user(user_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(false)
    }

    async fn set_reminder(
        &self,
        user_id: &str,
        kind: ReminderKind,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE drip_user SET {} = $1 WHERE id = $2",
            reminder_column(kind)
        );
        let result = sqlx::query(&sql)
            .bind(opt_ts(at))
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn nudge_due_users(&self, now: DateTime<Utc>) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT u.* FROM drip_user u \
             JOIN subscription s ON s.user_id = u.id \
             WHERE u.pending_nudge_at IS NOT NULL \
               AND u.pending_nudge_at <= $1 \
               AND s.active = 0 \
             ORDER BY u.id",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    // ─── Subscriptions ───────────────────────────────────────────

    async fn find_subscription(&self, user_id: &str) -> StoreResult<Option<Subscription>> {
        sqlx::query("SELECT * FROM subscription WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| subscription_from_row(&row))
            .transpose()
    }

    async fn start_trial(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<Subscription> {
        sqlx::query(
            "INSERT INTO subscription \
             (user_id, active, paid_until, trial_days_used, activated_at, created_at, updated_at) \
             VALUES ($1, 1, NULL, 0, $2, $2, $2) \
             ON CONFLICT (user_id) DO UPDATE SET active = 1, activated_at = $2, updated_at = $2",
        )
        .bind(user_id)
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_subscription(user_id)
            .await?
            .ok_or_else(|| StoreError::Backend("trial upsert vanished".into()))
    }

    async fn extend_subscription(
        &self,
        user_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        for attempt in 0..EXTEND_RETRIES {
            let existing = self.find_subscription(user_id).await?;

            match existing {
                None => {
                    let new_until = now + chrono::Duration::days(days);
                    let inserted = sqlx::query(
                        "INSERT INTO subscription \
                         (user_id, active, paid_until, trial_days_used, activated_at, \
                          created_at, updated_at) \
                         VALUES ($1, 1, $2, 0, $3, $3, $3) \
                         ON CONFLICT (user_id) DO NOTHING",
                    )
                    .bind(user_id)
                    .bind(ts(new_until))
                    .bind(ts(now))
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;

                    if inserted.rows_affected() == 1 {
                        return self
                            .find_subscription(user_id)
                            .await?
                            .ok_or_else(|| StoreError::Backend("extension vanished".into()));
                    }
                    // Another handler created the row first — retry against it.
                }
                Some(sub) => {
                    let base = match sub.paid_until {
                        Some(until) if until > now => until,
                        _ => now,
                    };
                    let new_until = base + chrono::Duration::days(days);

                    // Guard on the previous expiry: a concurrent extension
                    // changes it and sends us around the loop again.
                    let updated = sqlx::query(
                        "UPDATE subscription \
                         SET paid_until = $1, active = 1, \
                             activated_at = COALESCE(activated_at, $2), updated_at = $2 \
                         WHERE user_id = $3 \
                           AND COALESCE(paid_until, '') = COALESCE($4, '')",
                    )
                    .bind(ts(new_until))
                    .bind(ts(now))
                    .bind(user_id)
                    .bind(opt_ts(sub.paid_until))
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;

                    if updated.rows_affected() == 1 {
                        return self
                            .find_subscription(user_id)
                            .await?
                            .ok_or_else(|| StoreError::Backend("extension vanished".into()));
                    }
                }
            }
            debug!(user = %user_id, attempt, "extension CAS lost; retrying");
        }

        Err(StoreError::Conflict(format!(
            "subscription extension for {user_id} kept losing the race"
        )))
    }

    async fn record_trial_progress(&self, user_id: &str, day: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE subscription \
             SET trial_days_used = CASE WHEN trial_days_used < $1 THEN $1 ELSE trial_days_used END \
             WHERE user_id = $2",
        )
        .bind(day)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription {user_id}")));
        }
        Ok(())
    }

    async fn latch_expiry(&self, user_id: &str, trial_floor: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE subscription \
             SET active = 0, \
                 trial_days_used = CASE WHEN trial_days_used < $1 THEN $1 ELSE trial_days_used END \
             WHERE user_id = $2 AND active = 1",
        )
        .bind(trial_floor)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    // ─── Gifts ───────────────────────────────────────────────────

    async fn create_gift(&self, gift: GiftSubscription) -> StoreResult<GiftSubscription> {
        let result = sqlx::query(
            "INSERT INTO gift_subscription \
             (token, status, plan_id, days, purchaser_id, redeemed_by_user_id, \
              paid_at, redeemed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&gift.token)
        .bind(gift.status.as_str())
        .bind(&gift.plan_id)
        .bind(gift.days)
        .bind(&gift.purchaser_id)
        .bind(&gift.redeemed_by_user_id)
        .bind(opt_ts(gift.paid_at))
        .bind(opt_ts(gift.redeemed_at))
        .bind(ts(gift.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(gift),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Conflict(format!("gift {} exists", gift.token)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn find_gift(&self, token: &str) -> StoreResult<Option<GiftSubscription>> {
        sqlx::query("SELECT * FROM gift_subscription WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| gift_from_row(&row))
            .transpose()
    }

    async fn mark_gift_paid(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GiftSubscription>> {
        let result = sqlx::query(
            "UPDATE gift_subscription SET status = 'paid', paid_at = $1 \
             WHERE token = $2 AND status IN ('created', 'pending_external')",
        )
        .bind(ts(now))
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return self.find_gift(token).await;
        }
        Ok(None)
    }

    async fn redeem_gift(
        &self,
        token: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RedeemOutcome> {
        let result = sqlx::query(
            "UPDATE gift_subscription \
             SET status = 'redeemed', redeemed_at = $1, redeemed_by_user_id = $2 \
             WHERE token = $3 AND status = 'paid' AND redeemed_at IS NULL",
        )
        .bind(ts(now))
        .bind(recipient_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            let gift = self
                .find_gift(token)
                .await?
                .ok_or_else(|| StoreError::Backend("redeemed gift vanished".into()))?;
            return Ok(RedeemOutcome::Redeemed(gift));
        }

        // Lost the CAS — classify the loss.
        match self.find_gift(token).await? {
            None => Ok(RedeemOutcome::NotFound),
            Some(gift) if gift.status == GiftStatus::Redeemed => Ok(RedeemOutcome::AlreadyRedeemed),
            Some(_) => Ok(RedeemOutcome::NotPaid),
        }
    }

    async fn latest_pending_external_gift(
        &self,
        purchaser_id: &str,
    ) -> StoreResult<Option<GiftSubscription>> {
        sqlx::query(
            "SELECT * FROM gift_subscription \
             WHERE purchaser_id = $1 AND status = 'pending_external' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(purchaser_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| gift_from_row(&row))
        .transpose()
    }

    // ─── Idempotency journal ─────────────────────────────────────

    async fn record_payment_event(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO payment_event (event_key, recorded_at) VALUES ($1, $2) \
             ON CONFLICT (event_key) DO NOTHING",
        )
        .bind(key)
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    // ─── Content ─────────────────────────────────────────────────

    async fn put_content(&self, item: ContentItem) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO content_item (day, title, declaration, body, exercise) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (day) DO UPDATE SET \
               title = $2, declaration = $3, body = $4, exercise = $5",
        )
        .bind(item.day)
        .bind(&item.title)
        .bind(&item.declaration)
        .bind(&item.body)
        .bind(&item.exercise)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn content_for_day(&self, day: i64) -> StoreResult<Option<ContentItem>> {
        sqlx::query("SELECT * FROM content_item WHERE day = $1")
            .bind(day)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| content_from_row(&row))
            .transpose()
    }

    async fn content_len(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM content_item")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        row.try_get::<i64, _>("n").map_err(decode_err)
    }

    // ─── Settings ────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM setting WHERE setting_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get::<String, _>("value").map_err(decode_err))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO setting (setting_key, value) VALUES ($1, $2) \
             ON CONFLICT (setting_key) DO UPDATE SET value = $2",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let a = ts("2025-06-01T09:00:00Z".parse().unwrap());
        let b = ts("2025-06-01T09:00:01Z".parse().unwrap());
        assert_eq!(a, "2025-06-01T09:00:00.000Z");
        assert_eq!(a.len(), b.len());
        // Lexicographic order matches chronological order.
        assert!(a < b);
    }

    #[test]
    fn timestamp_round_trip() {
        let dt: DateTime<Utc> = "2025-06-01T09:00:00.123Z".parse().unwrap();
        assert_eq!(parse_ts(&ts(dt)).unwrap(), dt);
        assert!(parse_ts("yesterday-ish").is_err());
    }

    #[test]
    fn reminder_columns() {
        assert_eq!(reminder_column(ReminderKind::Morning), "pending_morning_at");
        assert_eq!(reminder_column(ReminderKind::Evening), "pending_evening_at");
        assert_eq!(reminder_column(ReminderKind::Nudge), "pending_nudge_at");
    }
}
