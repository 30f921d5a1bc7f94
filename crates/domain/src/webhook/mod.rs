//! Webhook event records and retry schedule.

mod backoff;
mod event;

pub use backoff::BackoffSchedule;
pub use event::{DeliveryClaim, DeliveryStatus, WebhookEvent, WebhookEventType};
