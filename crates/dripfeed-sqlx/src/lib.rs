//! # dripfeed-sqlx
//!
//! SQL-backed [`Store`](dripfeed_core::store::Store) over `sqlx::AnyPool`,
//! supporting SQLite and Postgres through one runtime-polymorphic pool.
//! Timestamps are stored as fixed-width RFC 3339 TEXT (UTC, millisecond
//! precision) so range comparisons work lexicographically on both backends;
//! every racy mutation is a single guarded statement (`ON CONFLICT` upsert
//! or a `WHERE`-guarded `UPDATE` judged by affected rows).

pub mod schema;
pub mod store;

pub use schema::{migrate, SCHEMA};
pub use store::SqlxStore;
