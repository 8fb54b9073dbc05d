// Mutable process-wide settings with a short-lived in-memory cache.
//
// Slot times and message templates are editable at runtime (via the admin
// surface, out of scope here) and read on every scheduler tick, so reads go
// through a TTL cache instead of hitting the store each time. The clock is
// injected to keep cache expiry testable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::store::Store;

/// Setting key: local time-of-day of the morning delivery slot (`HH:MM`).
/// Unset disables morning delivery entirely.
pub const MORNING_TIME: &str = "morning_time";

/// Setting key: local time-of-day of the evening slot (`HH:MM`).
pub const EVENING_TIME: &str = "evening_time";

/// Setting key: template for the access-expired message.
pub const MSG_ACCESS_EXPIRED: &str = "msg_access_expired";

/// Setting key: template for the subscription nudge.
pub const MSG_SUBSCRIPTION_NUDGE: &str = "msg_subscription_nudge";

/// Setting key: template for the evening reflection prompt.
pub const MSG_EVENING_PROMPT: &str = "msg_evening_prompt";

const CACHE_TTL_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedValue {
    value: Option<String>,
    expires_at: DateTime<Utc>,
}

/// TTL-cached reader over the store's `setting` table.
#[derive(Debug, Clone)]
pub struct SettingsCache {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    cache: Arc<RwLock<HashMap<String, CachedValue>>>,
    ttl: Duration,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::seconds(CACHE_TTL_SECS),
        }
    }

    /// Read a setting, serving the cached value until its TTL elapses.
    /// Absent settings are cached too (negative caching).
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.expires_at > now {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = self.store.get_setting(key).await?;
        let mut cache = self.cache.write().await;
        cache.insert(
            key.to_string(),
            CachedValue {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(value)
    }

    /// Write through to the store and drop the cached entry.
    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.store.set_setting(key, value).await?;
        self.cache.write().await.remove(key);
        Ok(())
    }

    /// Drop every cached entry.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}
