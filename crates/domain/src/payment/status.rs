//! Payment status state machine.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The status of a payment transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Processing ──┬──► Completed ──► Refunded
///           │        ▲        │
///           │        └────────┴──► Failed
///           └──► Cancelled
/// ```
///
/// `Failed → Processing` is the explicit retry path. `Cancelled` and
/// `Refunded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Payment has been requested and is waiting to be processed.
    #[default]
    Pending,

    /// An authorization attempt is in flight.
    Processing,

    /// The gateway authorized the payment.
    Completed,

    /// The last authorization attempt failed.
    Failed,

    /// The payment was cancelled before processing (terminal state).
    Cancelled,

    /// A completed payment was refunded (terminal state).
    Refunded,
}

impl PaymentStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [PaymentStatus; 6] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::Completed,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
        PaymentStatus::Refunded,
    ];

    /// Returns the statuses reachable from this one in a single step.
    pub fn allowed_targets(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[PaymentStatus::Processing, PaymentStatus::Cancelled],
            PaymentStatus::Processing => &[PaymentStatus::Completed, PaymentStatus::Failed],
            PaymentStatus::Completed => &[PaymentStatus::Refunded],
            PaymentStatus::Failed => &[PaymentStatus::Processing],
            PaymentStatus::Cancelled | PaymentStatus::Refunded => &[],
        }
    }

    /// Returns true if the transition table allows moving to `target`.
    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Returns true if a processing pass may start from this status.
    pub fn can_process(&self) -> bool {
        self.can_transition_to(PaymentStatus::Processing)
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError::new("PaymentStatus", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(PaymentStatus::default(), PaymentStatus::Pending);
    }

    #[test]
    fn test_pending_transitions() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Processing));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Cancelled));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Refunded));
    }

    #[test]
    fn test_processing_resolves_to_completed_or_failed() {
        assert!(PaymentStatus::Processing.can_transition_to(PaymentStatus::Completed));
        assert!(PaymentStatus::Processing.can_transition_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Processing.can_transition_to(PaymentStatus::Cancelled));
        assert!(!PaymentStatus::Processing.can_transition_to(PaymentStatus::Pending));
    }

    #[test]
    fn test_failed_can_be_retried() {
        assert!(PaymentStatus::Failed.can_process());
        assert!(PaymentStatus::Pending.can_process());
        assert!(!PaymentStatus::Completed.can_process());
        assert!(!PaymentStatus::Processing.can_process());
    }

    #[test]
    fn test_no_self_transitions() {
        for status in PaymentStatus::ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(!PaymentStatus::Completed.is_terminal());
        assert!(!PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Cancelled.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_display_and_parse() {
        for status in PaymentStatus::ALL {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("SETTLED".parse::<PaymentStatus>().is_err());
        assert_eq!(PaymentStatus::Refunded.to_string(), "REFUNDED");
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&PaymentStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let deserialized: PaymentStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, PaymentStatus::Processing);
    }
}
