//! Domain model for the payment transaction lifecycle engine.
//!
//! This crate provides:
//! - Input validation for payment requests
//! - The payment transaction record and its status state machine
//! - Webhook event records with their delivery bookkeeping and backoff table

pub mod error;
pub mod payment;
pub mod validation;
pub mod webhook;

pub use error::{ParseError, TransitionError, WebhookStateError};
pub use payment::{
    CardDetails, PaymentMethodType, PaymentRequest, PaymentStatus, PaymentStatusHistory,
    PaymentTransaction, StatusChange,
};
pub use validation::{
    FieldViolation, PaymentRequestInput, ValidationErrors, ValidationLimits, Validator,
};
pub use webhook::{BackoffSchedule, DeliveryClaim, DeliveryStatus, WebhookEvent, WebhookEventType};
