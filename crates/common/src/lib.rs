//! Shared identifiers and configuration primitives for the payment engine.

pub mod config;
mod types;

pub use config::ConfigError;
pub use types::{HistoryId, OrderId, PaymentId, PaymentMethodId, UserId, WebhookEventId};
