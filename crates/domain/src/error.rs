//! Domain error types.

use common::{PaymentId, WebhookEventId};
use thiserror::Error;

use crate::payment::PaymentStatus;
use crate::webhook::DeliveryStatus;

/// A status change that the transition table does not allow.
///
/// This indicates a caller or logic bug; the transaction is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition for payment {payment_id}: {from} -> {to}")]
    InvalidTransition {
        payment_id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

/// Attempted mutation of a webhook event that has already reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookStateError {
    #[error("Webhook event {event_id} is already {status}")]
    AlreadyTerminal {
        event_id: WebhookEventId,
        status: DeliveryStatus,
    },
}

/// A stored enum value that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind} value: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
