// Engine configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::Plan;

/// Number of content days covered by the trial. Access to day 8 and beyond
/// requires a paid grant.
pub const TRIAL_LIMIT: i64 = 7;

/// Static engine configuration. Mutable process-wide settings (slot times,
/// message templates) live in the `setting` table instead, behind the
/// TTL-cached [`crate::settings::SettingsCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripOptions {
    /// Content days granted before a paid subscription is required.
    #[serde(default = "default_trial_limit")]
    pub trial_limit: i64,
    /// Catch-up window for deferred reminders, in seconds. A reminder that
    /// elapsed longer ago than this is silently dropped.
    #[serde(default = "default_reminder_window_secs")]
    pub reminder_window_secs: i64,
    /// Available subscription plans.
    #[serde(default)]
    pub plans: Vec<Plan>,
    /// Base URL for gift redemption deep-links, e.g.
    /// `https://t.me/dripfeed_bot?start=gift_`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gift_link_base: Option<String>,
}

fn default_trial_limit() -> i64 {
    TRIAL_LIMIT
}

fn default_reminder_window_secs() -> i64 {
    120
}

impl Default for DripOptions {
    fn default() -> Self {
        Self {
            trial_limit: TRIAL_LIMIT,
            reminder_window_secs: default_reminder_window_secs(),
            plans: default_plans(),
            gift_link_base: None,
        }
    }
}

/// The stock plan catalog.
pub fn default_plans() -> Vec<Plan> {
    vec![
        Plan {
            id: "week".into(),
            name: "One week".into(),
            days: 7,
            amount_minor: 15900,
            currency: "RUB".into(),
        },
        Plan {
            id: "month".into(),
            name: "One month".into(),
            days: 30,
            amount_minor: 39900,
            currency: "RUB".into(),
        },
        Plan {
            id: "course".into(),
            name: "Full course".into(),
            days: 80,
            amount_minor: 99900,
            currency: "RUB".into(),
        },
    ]
}

impl DripOptions {
    /// Find a plan by ID.
    pub fn find_plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// The reminder catch-up window as a chrono duration.
    pub fn reminder_window(&self) -> Duration {
        Duration::seconds(self.reminder_window_secs)
    }

    /// Build the redemption deep-link for a gift token, if a base is set.
    pub fn gift_link(&self, token: &str) -> Option<String> {
        self.gift_link_base
            .as_ref()
            .map(|base| format!("{base}{token}"))
    }
}
