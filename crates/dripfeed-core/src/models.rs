// Database models for the content pacer.
//
// `Subscription` is the canonical per-user ledger: the `active` flag, the
// paid expiry, and the trial counter. It is created lazily (upsert) and
// never deleted. `GiftSubscription` status transitions are forward-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A subscriber in the paced content stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Fixed-offset timezone string, e.g. `"UTC+03:00"`.
    pub timezone: String,
    /// Monotonic content pointer (>= 1). Points at the *next* day to deliver;
    /// wraps past the end of the content sequence.
    pub current_day: i64,
    /// When the paced stream began. `None` means the user has not started —
    /// such users are filtered out of the delivery scan entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_started_at: Option<DateTime<Utc>>,
    /// Whether the onboarding flow has been completed.
    pub onboarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Deferred redelivery of the morning content ("remind me later").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_morning_at: Option<DateTime<Utc>>,
    /// Deferred redelivery of the evening prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_evening_at: Option<DateTime<Utc>>,
    /// Deferred subscription nudge ("remind me in two days").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_nudge_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, timezone: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timezone: timezone.into(),
            current_day: 1,
            stream_started_at: None,
            onboarded: false,
            display_name: None,
            pending_morning_at: None,
            pending_evening_at: None,
            pending_nudge_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The canonical per-user access ledger (1:1 with `User`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: String,
    pub active: bool,
    /// Paid access expiry. `None` means access is trial-governed, not
    /// calendar-governed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_until: Option<DateTime<Utc>>,
    pub trial_days_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a paid expiry is set and still in the future.
    pub fn paid_active(&self, now: DateTime<Utc>) -> bool {
        self.active && self.paid_until.map(|t| t > now).unwrap_or(false)
    }
}

/// Gift status machine. Transitions are forward-only:
/// `created`/`pending_external` → `paid` → `redeemed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftStatus {
    Created,
    /// Purchase intent recorded for a gateway with no local checkout step;
    /// the payment confirmation arrives later on the external webhook.
    PendingExternal,
    Paid,
    Redeemed,
}

impl GiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PendingExternal => "pending_external",
            Self::Paid => "paid",
            Self::Redeemed => "redeemed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "pending_external" => Some(Self::PendingExternal),
            "paid" => Some(Self::Paid),
            "redeemed" => Some(Self::Redeemed),
            _ => None,
        }
    }
}

/// A one-time redeemable gift, decoupling purchaser from beneficiary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftSubscription {
    /// Opaque, unguessable redemption token.
    pub token: String,
    pub status: GiftStatus,
    pub plan_id: String,
    pub days: i64,
    pub purchaser_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_by_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One unit of paced daily material. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    /// Position in the dense sequence, starting at 1.
    pub day: i64,
    pub title: String,
    pub declaration: String,
    pub body: String,
    pub exercise: String,
}

/// A purchasable subscription plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Days of paid access granted.
    pub days: i64,
    /// Price in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
}
