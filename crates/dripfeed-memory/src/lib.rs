//! # dripfeed-memory
//!
//! In-memory [`Store`](dripfeed_core::store::Store) implementation backed by
//! `HashMap`s behind a single `tokio::sync::RwLock`. Every compare-and-set
//! operation runs under the write lock, giving the same atomicity the SQL
//! backend gets from guarded statements. Data is lost on drop — intended for
//! tests and demos.

mod store;

pub use store::MemoryStore;
