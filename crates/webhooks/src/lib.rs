//! Webhook delivery engine.
//!
//! Notifies external consumers of payment status changes with at-least-once
//! delivery and bounded, escalating retry.

pub mod config;
pub mod engine;
pub mod error;
pub mod payload;
pub mod sweeper;
pub mod transport;

pub use config::{WebhookConfig, WebhookConfigBuilder};
pub use engine::{DeliveryOutcome, SweepReport, WebhookEngine};
pub use error::{Result, WebhookError};
pub use payload::{HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_TIMESTAMP, WebhookPayload};
pub use sweeper::WebhookSweeper;
pub use transport::{
    DeliveryResult, HttpWebhookTransport, InMemoryWebhookTransport, ScriptedResponse,
    WebhookRequest, WebhookTransport,
};
