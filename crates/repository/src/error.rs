use common::{OrderId, PaymentId, WebhookEventId};
use domain::{ParseError, PaymentStatus};
use thiserror::Error;

/// Errors that can occur when interacting with the payment repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The stored status no longer matches the status the transition was
    /// computed from. Another writer got there first.
    #[error(
        "Concurrency conflict for payment {payment_id}: expected status {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        payment_id: PaymentId,
        expected: PaymentStatus,
        actual: PaymentStatus,
    },

    /// The order already has a completed payment.
    #[error("Order {order_id} already has a completed payment")]
    OrderAlreadyPaid { order_id: OrderId },

    /// The delivery claim expired and was taken over, or the event reached a
    /// terminal status while the attempt was in flight.
    #[error("Claim lost for webhook event {event_id}")]
    ClaimLost { event_id: WebhookEventId },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored column held a value the domain model cannot represent.
    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: &'static str, reason: String },
}

impl RepositoryError {
    pub fn payment_not_found(id: PaymentId) -> Self {
        Self::NotFound {
            entity: "Payment",
            id: id.to_string(),
        }
    }

    pub fn webhook_event_not_found(id: WebhookEventId) -> Self {
        Self::NotFound {
            entity: "Webhook event",
            id: id.to_string(),
        }
    }

    /// Returns true for failures of the storage backend itself, where the
    /// same call may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<ParseError> for RepositoryError {
    fn from(err: ParseError) -> Self {
        Self::Decode {
            column: err.kind,
            reason: err.to_string(),
        }
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
