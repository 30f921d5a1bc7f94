//! Webhook engine error types.

use domain::WebhookStateError;
use repository::RepositoryError;
use thiserror::Error;

/// Errors that can occur while preparing, storing or delivering webhooks.
///
/// A failed delivery attempt is not an error: it is recorded on the event.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Repository error.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The event was already terminal when an update was attempted.
    #[error(transparent)]
    State(#[from] WebhookStateError),

    /// The delivery pool was closed while waiting for a slot.
    #[error("Delivery pool is closed")]
    PoolClosed,

    /// Payload serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for webhook results.
pub type Result<T> = std::result::Result<T, WebhookError>;
