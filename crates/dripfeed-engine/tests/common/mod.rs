// Shared test harness: in-memory store, manual clock, recording transport.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use dripfeed_core::clock::ManualClock;
use dripfeed_core::error::{DripError, Result};
use dripfeed_core::models::{ContentItem, User};
use dripfeed_core::options::DripOptions;
use dripfeed_core::store::Store;
use dripfeed_engine::context::EngineContext;
use dripfeed_engine::ports::{MessageSender, OutboundMessage};
use dripfeed_memory::MemoryStore;

/// Transport double that records every delivery and can fail on demand.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    fail_users: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, user_id: &str) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == user_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    /// Make every delivery to `user_id` fail with a transport error.
    pub async fn fail_for(&self, user_id: &str) {
        self.fail_users.lock().await.insert(user_id.to_string());
    }

    pub async fn heal(&self, user_id: &str) {
        self.fail_users.lock().await.remove(user_id);
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn deliver(&self, user_id: &str, message: OutboundMessage) -> Result<()> {
        if self.fail_users.lock().await.contains(user_id) {
            return Err(DripError::Transport(format!("send to {user_id} failed")));
        }
        self.sent
            .lock()
            .await
            .push((user_id.to_string(), message));
        Ok(())
    }
}

/// Everything a scenario test needs.
pub struct Harness {
    pub store: MemoryStore,
    pub sender: Arc<RecordingSender>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<EngineContext>,
}

pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

/// Build a harness with the stock options and a manual clock at `start`.
pub fn harness(start: &str) -> Harness {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    let clock = Arc::new(ManualClock::new(at(start)));

    let mut options = DripOptions::default();
    options.gift_link_base = Some("https://t.me/dripfeed_bot?start=gift_".into());

    let ctx = EngineContext::new(
        Arc::new(store.clone()),
        sender.clone(),
        clock.clone(),
        options,
    );

    Harness {
        store,
        sender,
        clock,
        ctx,
    }
}

/// Seed a dense content sequence of `len` days.
pub async fn seed_content(store: &MemoryStore, len: i64) {
    for day in 1..=len {
        store
            .put_content(ContentItem {
                day,
                title: format!("Principle {day}"),
                declaration: format!("Declaration {day}"),
                body: format!("Body {day}"),
                exercise: format!("Exercise {day}"),
            })
            .await
            .unwrap();
    }
}

/// Seed a user already in the paced stream with an active trial.
pub async fn seed_stream_user(
    h: &Harness,
    id: &str,
    timezone: &str,
    current_day: i64,
    started_at: DateTime<Utc>,
) -> User {
    let mut user = User::new(id, timezone, started_at);
    user.onboarded = true;
    h.store.create_user(user).await.unwrap();
    h.store.set_onboarded(id, started_at).await.unwrap();
    h.store.start_stream(id, started_at, 2).await.unwrap();
    if current_day != 2 {
        h.store.advance_day(id, 2, current_day).await.unwrap();
    }
    h.store.start_trial(id, started_at).await.unwrap();
    h.store.find_user(id).await.unwrap().unwrap()
}

/// Fetch the freshest copy of a user.
pub async fn refresh(h: &Harness, id: &str) -> User {
    h.store.find_user(id).await.unwrap().unwrap()
}
