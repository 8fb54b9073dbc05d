// Scheduler scenarios: slot matching across timezones, reminder windows,
// failure isolation, and the housekeeping sweeps.

mod common;

use chrono::Duration;

use common::*;
use dripfeed_core::settings::{EVENING_TIME, MORNING_TIME};
use dripfeed_core::store::{ReminderKind, Store};
use dripfeed_engine::ports::OutboundMessage;
use dripfeed_engine::scheduler::DeliveryScheduler;

async fn set_slots(h: &Harness, morning: Option<&str>, evening: Option<&str>) {
    if let Some(m) = morning {
        h.store.set_setting(MORNING_TIME, m).await.unwrap();
    }
    if let Some(e) = evening {
        h.store.set_setting(EVENING_TIME, e).await.unwrap();
    }
}

#[tokio::test]
async fn utc_plus_three_stream_start_scenario() {
    // User in UTC+3, morning slot 09:00, stream started today at 09:00
    // local. The same-day slot must not resend day 1; the next local 09:00
    // delivers day 2.
    let start = "2025-06-01T06:00:00Z"; // 09:00 UTC+3
    let h = harness(start);
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 2, at(start)).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    // The matching minute on the start day.
    scheduler.tick(at(start)).await;
    assert!(h.sender.sent_to("u1").await.is_empty());

    // Off-slot minutes deliver nothing either.
    scheduler.tick(at("2025-06-01T12:00:00Z")).await;
    assert!(h.sender.sent_to("u1").await.is_empty());

    // Next local morning: day 2, exactly once.
    scheduler.tick(at("2025-06-02T06:00:00Z")).await;
    let messages = h.sender.sent_to("u1").await;
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        messages[0],
        OutboundMessage::MorningContent { day: 2, redelivery: false, .. }
    ));
    assert_eq!(refresh(&h, "u1").await.current_day, 3);

    // The following morning: day 3.
    scheduler.tick(at("2025-06-03T06:00:00Z")).await;
    let messages = h.sender.sent_to("u1").await;
    assert_eq!(messages.len(), 2);
    assert!(matches!(
        messages[1],
        OutboundMessage::MorningContent { day: 3, .. }
    ));
}

#[tokio::test]
async fn slot_matches_to_the_minute() {
    let h = harness("2025-06-02T05:59:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 2, at("2025-06-01T06:00:00Z")).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    scheduler.tick(at("2025-06-02T05:59:00Z")).await; // 08:59 local
    scheduler.tick(at("2025-06-02T06:01:00Z")).await; // 09:01 local
    assert!(h.sender.sent_to("u1").await.is_empty());

    scheduler.tick(at("2025-06-02T06:00:00Z")).await; // 09:00 local
    assert_eq!(h.sender.sent_to("u1").await.len(), 1);
}

#[tokio::test]
async fn unset_slot_disables_delivery_entirely() {
    let h = harness("2025-06-02T06:00:00Z");
    seed_content(&h.store, 80).await;
    // No slots configured at all.
    seed_stream_user(&h, "u1", "UTC+03:00", 2, at("2025-06-01T06:00:00Z")).await;
    // Even an elapsed reminder stays silent while the slot is unset.
    h.store
        .set_reminder(
            "u1",
            ReminderKind::Morning,
            Some(at("2025-06-02T05:59:30Z")),
        )
        .await
        .unwrap();
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    scheduler.tick(at("2025-06-02T06:00:00Z")).await;
    assert!(h.sender.sent().await.is_empty());
    assert_eq!(refresh(&h, "u1").await.current_day, 2);
}

#[tokio::test]
async fn reminder_fires_inside_window_only() {
    let h = harness("2025-06-02T10:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 5, at("2025-06-01T06:00:00Z")).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    // Ten minutes stale: outside the catch-up window, silently dropped.
    h.store
        .set_reminder(
            "u1",
            ReminderKind::Morning,
            Some(at("2025-06-02T09:50:00Z")),
        )
        .await
        .unwrap();
    scheduler.tick(at("2025-06-02T10:00:00Z")).await;
    assert!(h.sender.sent_to("u1").await.is_empty());

    // One minute stale: inside the window — redelivery of the last sent day.
    h.store
        .set_reminder(
            "u1",
            ReminderKind::Morning,
            Some(at("2025-06-02T09:59:00Z")),
        )
        .await
        .unwrap();
    scheduler.tick(at("2025-06-02T10:00:00Z")).await;
    let messages = h.sender.sent_to("u1").await;
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        messages[0],
        OutboundMessage::MorningContent { day: 4, redelivery: true, .. }
    ));
    assert!(refresh(&h, "u1").await.pending_morning_at.is_none());
    // Reminders never advance the pointer.
    assert_eq!(refresh(&h, "u1").await.current_day, 5);
}

#[tokio::test]
async fn per_user_failure_never_aborts_the_scan() {
    let h = harness("2025-06-02T06:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 2, at("2025-06-01T06:00:00Z")).await;
    seed_stream_user(&h, "u2", "UTC+03:00", 2, at("2025-06-01T06:00:00Z")).await;
    h.sender.fail_for("u1").await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    scheduler.tick(at("2025-06-02T06:00:00Z")).await;

    assert!(h.sender.sent_to("u1").await.is_empty());
    assert_eq!(h.sender.sent_to("u2").await.len(), 1);
}

#[tokio::test]
async fn broken_timezone_only_breaks_its_user() {
    let h = harness("2025-06-02T06:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "Atlantis/Nowhere", 2, at("2025-06-01T06:00:00Z")).await;
    seed_stream_user(&h, "u2", "UTC+03:00", 2, at("2025-06-01T06:00:00Z")).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    scheduler.tick(at("2025-06-02T06:00:00Z")).await;

    assert!(h.sender.sent_to("u1").await.is_empty());
    assert_eq!(h.sender.sent_to("u2").await.len(), 1);
}

#[tokio::test]
async fn evening_slot_sends_reflection_prompt() {
    let h = harness("2025-06-02T18:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), Some("21:00")).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 5, at("2025-06-01T06:00:00Z")).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    scheduler.tick(at("2025-06-02T18:00:00Z")).await; // 21:00 local

    assert_eq!(
        h.sender.sent_to("u1").await,
        vec![OutboundMessage::EveningPrompt { day: 4 }]
    );
    assert_eq!(refresh(&h, "u1").await.current_day, 5);
}

#[tokio::test]
async fn nudge_sweep_runs_on_the_tenth_tick() {
    let base = at("2025-06-02T12:00:00Z");
    let h = harness("2025-06-02T12:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 9, base - Duration::days(10)).await;
    h.store.latch_expiry("u1", 7).await.unwrap();
    h.store
        .set_reminder("u1", ReminderKind::Nudge, Some(base - Duration::hours(1)))
        .await
        .unwrap();
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    // Ticks 1-9: no sweep yet.
    for i in 0..9 {
        scheduler.tick(base + Duration::minutes(i)).await;
    }
    assert!(h.sender.sent_to("u1").await.is_empty());

    // Tick 10: nudge sent and cleared.
    scheduler.tick(base + Duration::minutes(9)).await;
    assert_eq!(
        h.sender.sent_to("u1").await,
        vec![OutboundMessage::SubscriptionNudge]
    );
    assert!(refresh(&h, "u1").await.pending_nudge_at.is_none());

    // Tick 20: nothing left to nudge.
    for i in 10..20 {
        scheduler.tick(base + Duration::minutes(i)).await;
    }
    assert_eq!(h.sender.sent_to("u1").await.len(), 1);
}

#[tokio::test]
async fn expiry_sweep_latches_between_mornings() {
    let base = at("2025-06-02T12:00:00Z");
    let h = harness("2025-06-02T12:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    // Day 9, trial only: access is gone but nothing has latched yet.
    seed_stream_user(&h, "u1", "UTC+03:00", 9, base - Duration::days(10)).await;
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    // 60 ticks trigger the consistency sweep.
    for i in 0..60 {
        scheduler.tick(base + Duration::minutes(i)).await;
    }
    assert_eq!(
        h.sender.sent_to("u1").await,
        vec![OutboundMessage::AccessExpired]
    );
    let sub = h.store.find_subscription("u1").await.unwrap().unwrap();
    assert!(!sub.active);
    assert_eq!(sub.trial_days_used, 7);

    // Another 60 ticks: the latch holds, no repeat message.
    for i in 60..120 {
        scheduler.tick(base + Duration::minutes(i)).await;
    }
    assert_eq!(h.sender.sent_to("u1").await.len(), 1);
}

#[tokio::test]
async fn paid_user_survives_expiry_sweep() {
    let base = at("2025-06-02T12:00:00Z");
    let h = harness("2025-06-02T12:00:00Z");
    seed_content(&h.store, 80).await;
    set_slots(&h, Some("09:00"), None).await;
    seed_stream_user(&h, "u1", "UTC+03:00", 9, base - Duration::days(10)).await;
    h.store.extend_subscription("u1", 30, base).await.unwrap();
    let scheduler = DeliveryScheduler::new(h.ctx.clone());

    for i in 0..60 {
        scheduler.tick(base + Duration::minutes(i)).await;
    }

    assert!(h.sender.sent_to("u1").await.is_empty());
    let sub = h.store.find_subscription("u1").await.unwrap().unwrap();
    assert!(sub.active);
}
