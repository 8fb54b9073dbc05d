// Outbound messaging port.
//
// The engine never renders text: it hands typed messages to the transport
// collaborator (a chat bot, in the reference deployment), which owns
// templates and keyboards.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dripfeed_core::error::Result;
use dripfeed_core::models::ContentItem;

/// A typed message for the transport layer to render and deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// The day's paced content.
    MorningContent {
        day: i64,
        item: ContentItem,
        /// True when this is a deferred redelivery rather than the slot
        /// delivery.
        redelivery: bool,
    },
    /// The evening reflection prompt; `day` is the content day being
    /// reflected on.
    EveningPrompt { day: i64 },
    /// Trial or paid access ran out. Sent at most once per expiry.
    AccessExpired,
    /// Deferred subscription nudge.
    SubscriptionNudge,
    /// A payment was applied to the user's own ledger.
    PaymentConfirmed { paid_until: DateTime<Utc> },
    /// A purchased gift is paid and ready to forward; goes to the purchaser.
    GiftReady {
        token: String,
        days: i64,
        link: Option<String>,
    },
}

/// Message transport collaborator.
///
/// Errors are per-user and transient: the scheduler logs them and moves on;
/// delivery is retried implicitly on the next matching trigger, never within
/// the same tick.
#[async_trait]
pub trait MessageSender: Send + Sync + fmt::Debug {
    async fn deliver(&self, user_id: &str, message: OutboundMessage) -> Result<()>;
}
