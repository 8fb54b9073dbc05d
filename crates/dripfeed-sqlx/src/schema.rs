// Schema DDL, portable across SQLite and Postgres.
//
// Booleans are INTEGER 0/1, timestamps are RFC 3339 TEXT. `BIGINT` keeps
// integer affinity on SQLite and a real 64-bit column on Postgres.

use sqlx::AnyPool;

use dripfeed_core::error::{StoreError, StoreResult};

/// The full schema.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS drip_user (
    id TEXT PRIMARY KEY NOT NULL,
    timezone TEXT NOT NULL,
    current_day BIGINT NOT NULL DEFAULT 1,
    stream_started_at TEXT,
    onboarded INTEGER NOT NULL DEFAULT 0,
    display_name TEXT,
    pending_morning_at TEXT,
    pending_evening_at TEXT,
    pending_nudge_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_drip_user_stream ON drip_user(stream_started_at);

CREATE TABLE IF NOT EXISTS subscription (
    user_id TEXT PRIMARY KEY NOT NULL REFERENCES drip_user(id) ON DELETE CASCADE,
    active INTEGER NOT NULL DEFAULT 0,
    paid_until TEXT,
    trial_days_used BIGINT NOT NULL DEFAULT 0,
    activated_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gift_subscription (
    token TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL DEFAULT 'created',
    plan_id TEXT NOT NULL,
    days BIGINT NOT NULL,
    purchaser_id TEXT NOT NULL,
    redeemed_by_user_id TEXT,
    paid_at TEXT,
    redeemed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gift_purchaser_status
    ON gift_subscription(purchaser_id, status);

CREATE TABLE IF NOT EXISTS content_item (
    day BIGINT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    declaration TEXT NOT NULL,
    body TEXT NOT NULL,
    exercise TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_event (
    event_key TEXT PRIMARY KEY NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS setting (
    setting_key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the schema, statement by statement.
pub async fn migrate(pool: &AnyPool) -> StoreResult<()> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_covers_every_table() {
        for table in [
            "drip_user",
            "subscription",
            "gift_subscription",
            "content_item",
            "payment_event",
            "setting",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }
}
