//! # dripfeed-core
//!
//! Core domain types and ports for the dripfeed content pacer:
//! the per-user subscription ledger, gift records, the paced content
//! sequence, and the `Store` trait every storage backend implements.
//!
//! Higher layers (engine, gateways, HTTP surface) depend only on this crate.

pub mod clock;
pub mod env;
pub mod error;
pub mod event;
pub mod id;
pub mod models;
pub mod options;
pub mod settings;
pub mod store;
pub mod timezone;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DripError, Result, StoreError, StoreResult};
pub use event::GatewayEvent;
pub use models::*;
pub use options::DripOptions;
pub use store::{RedeemOutcome, ReminderKind, Store};
