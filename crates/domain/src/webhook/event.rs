use chrono::{DateTime, Utc};
use common::{PaymentId, WebhookEventId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backoff::BackoffSchedule;
use crate::error::{ParseError, WebhookStateError};
use crate::payment::PaymentStatus;

/// Kind of notification sent to webhook consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventType {
    PaymentProcessing,
    PaymentCompleted,
    PaymentFailed,
    PaymentCancelled,
    PaymentRefunded,
}

impl WebhookEventType {
    pub const ALL: [WebhookEventType; 5] = [
        WebhookEventType::PaymentProcessing,
        WebhookEventType::PaymentCompleted,
        WebhookEventType::PaymentFailed,
        WebhookEventType::PaymentCancelled,
        WebhookEventType::PaymentRefunded,
    ];

    /// The event announcing that a payment entered `status`, if any.
    pub fn for_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Pending => None,
            PaymentStatus::Processing => Some(WebhookEventType::PaymentProcessing),
            PaymentStatus::Completed => Some(WebhookEventType::PaymentCompleted),
            PaymentStatus::Failed => Some(WebhookEventType::PaymentFailed),
            PaymentStatus::Cancelled => Some(WebhookEventType::PaymentCancelled),
            PaymentStatus::Refunded => Some(WebhookEventType::PaymentRefunded),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::PaymentProcessing => "PAYMENT_PROCESSING",
            WebhookEventType::PaymentCompleted => "PAYMENT_COMPLETED",
            WebhookEventType::PaymentFailed => "PAYMENT_FAILED",
            WebhookEventType::PaymentCancelled => "PAYMENT_CANCELLED",
            WebhookEventType::PaymentRefunded => "PAYMENT_REFUNDED",
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WebhookEventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseError::new("WebhookEventType", s))
    }
}

/// Delivery state of a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Waiting for its first or next attempt.
    #[default]
    Pending,
    Delivered,
    /// Attempts exhausted.
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 4] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
        DeliveryStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError::new("DeliveryStatus", s))
    }
}

/// Exclusive right to attempt one delivery, valid until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryClaim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl DeliveryClaim {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            expires_at,
        }
    }
}

/// One notification to one endpoint, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub payment_id: PaymentId,
    pub event_type: WebhookEventType,
    /// Body sent on every attempt, frozen at creation.
    pub payload: serde_json::Value,
    pub endpoint_url: String,
    pub delivery_status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub claim_token: Option<Uuid>,
    #[serde(skip)]
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates a `Pending` event due immediately.
    pub fn new(
        payment_id: PaymentId,
        event_type: WebhookEventType,
        payload: serde_json::Value,
        endpoint_url: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            payment_id,
            event_type,
            payload,
            endpoint_url: endpoint_url.into(),
            delivery_status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            next_retry_at: Some(now),
            delivered_at: None,
            last_status_code: None,
            last_error: None,
            claim_token: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the event is waiting for an attempt that is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delivery_status == DeliveryStatus::Pending
            && self.attempts < self.max_attempts
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Returns true if the event is due and no live claim is held on it.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.claim_expires_at.is_none_or(|expires| expires <= now)
    }

    /// Records `claim` on the event. Callers check `is_claimable` under the
    /// same lock or row lock.
    pub fn claim(&mut self, claim: DeliveryClaim, now: DateTime<Utc>) {
        self.claim_token = Some(claim.token);
        self.claim_expires_at = Some(claim.expires_at);
        self.updated_at = now;
    }

    pub fn holds_claim(&self, token: Uuid) -> bool {
        self.claim_token == Some(token)
    }

    pub fn release_claim(&mut self) {
        self.claim_token = None;
        self.claim_expires_at = None;
    }

    /// Records a 2xx attempt.
    pub fn record_success(
        &mut self,
        status_code: u16,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookStateError> {
        self.ensure_pending()?;
        self.attempts += 1;
        self.delivery_status = DeliveryStatus::Delivered;
        self.last_attempt_at = Some(now);
        self.delivered_at = Some(now);
        self.last_status_code = Some(status_code);
        self.last_error = None;
        self.next_retry_at = None;
        self.updated_at = now;
        self.release_claim();
        Ok(())
    }

    /// Records a failed attempt and schedules the next one, or marks the
    /// event `Failed` once attempts are exhausted.
    pub fn record_failure(
        &mut self,
        status_code: Option<u16>,
        error: impl Into<String>,
        backoff: &BackoffSchedule,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookStateError> {
        self.ensure_pending()?;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.last_status_code = status_code;
        self.last_error = Some(error.into());
        self.updated_at = now;
        self.release_claim();

        if self.attempts < self.max_attempts {
            self.next_retry_at = Some(now + backoff.delay_for(self.attempts));
        } else {
            self.delivery_status = DeliveryStatus::Failed;
            self.next_retry_at = None;
        }
        Ok(())
    }

    /// Stops any further attempts.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), WebhookStateError> {
        self.ensure_pending()?;
        self.delivery_status = DeliveryStatus::Cancelled;
        self.next_retry_at = None;
        self.updated_at = now;
        self.release_claim();
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), WebhookStateError> {
        if self.delivery_status.is_terminal() {
            return Err(WebhookStateError::AlreadyTerminal {
                event_id: self.id,
                status: self.delivery_status,
            });
        }
        Ok(())
    }
}
