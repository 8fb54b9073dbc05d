//! # dripfeed-gateways
//!
//! The three payment channels, each with the same shape: authenticate the
//! raw payload first, parse second, map to the canonical
//! [`GatewayEvent`](dripfeed_core::event::GatewayEvent) last. No business
//! logic runs before verification succeeds, and nothing downstream ever sees
//! a provider-specific schema.
//!
//! - [`checkout`] — card checkout confirmations (`t=...,v1=...` HMAC header)
//! - [`cryptopay`] — crypto invoice webhooks plus the invoice-creation client
//! - [`external`] — external subscription-provider webhooks

pub mod checkout;
pub mod cryptopay;
pub mod error;
pub mod external;

pub use checkout::{CheckoutConfig, CheckoutGateway};
pub use cryptopay::{CryptoPayClient, CryptoPayConfig, CryptoPayGateway};
pub use error::GatewayError;
pub use external::{ExternalAction, ExternalConfig, ExternalGateway};
