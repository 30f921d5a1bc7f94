//! Processing error types.

use domain::{TransitionError, ValidationErrors};
use repository::RepositoryError;
use thiserror::Error;
use webhooks::WebhookError;

/// Errors that can occur while driving a payment through its lifecycle.
///
/// A declined charge is not an error: it is recorded on the transaction as
/// a `FAILED` status.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The payment request failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// The requested status change is not allowed from the current status.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Repository error.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Webhook engine error.
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    /// The worker pool queue no longer accepts payments.
    #[error("Payment queue is closed")]
    QueueClosed,
}

impl ProcessingError {
    /// Returns true if another caller changed the payment first.
    ///
    /// This covers both a lost compare-and-set and a transition that became
    /// invalid because the status had already moved on.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ProcessingError::Transition(_)
                | ProcessingError::Repository(RepositoryError::ConcurrencyConflict { .. })
        )
    }
}

/// Convenience type alias for processing results.
pub type Result<T> = std::result::Result<T, ProcessingError>;
