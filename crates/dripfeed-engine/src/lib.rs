//! # dripfeed-engine
//!
//! The clock-driven half of the system: the delivery scheduler scans the
//! stream-active population once a minute and dispatches progression
//! decisions, while the payment reconciler merges verified gateway events
//! into the same per-user ledger from concurrent request contexts.
//!
//! Everything here works against the `dripfeed-core` ports (`Store`,
//! `Clock`, `MessageSender`), so the whole engine runs deterministically
//! under test with a manual clock and an in-memory store.

pub mod context;
pub mod gifts;
pub mod ledger;
pub mod onboarding;
pub mod ports;
pub mod progression;
pub mod reconciler;
pub mod scheduler;

pub use context::EngineContext;
pub use gifts::GiftService;
pub use ledger::{GrantOutcome, SubscriptionLedger};
pub use onboarding::OnboardingService;
pub use ports::{MessageSender, OutboundMessage};
pub use progression::{ProgressionEngine, TriggerKind};
pub use reconciler::{PaymentReconciler, ReconcileOutcome};
pub use scheduler::DeliveryScheduler;
