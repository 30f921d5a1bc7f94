use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{OrderId, PaymentId, WebhookEventId};
use domain::{
    DeliveryClaim, PaymentStatus, PaymentStatusHistory, PaymentTransaction, WebhookEvent,
};
use uuid::Uuid;

use crate::{Result, WebhookEventQuery};

/// Everything a single status change writes, committed as one unit.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    /// The transaction in its new state.
    pub payment: PaymentTransaction,
    /// The audit row. Its `previous_status` is the status the stored
    /// transaction must still have for the commit to succeed.
    pub history: PaymentStatusHistory,
    /// Notifications created by this transition.
    pub webhook_events: Vec<WebhookEvent>,
}

impl TransitionRecord {
    pub fn new(payment: PaymentTransaction, history: PaymentStatusHistory) -> Self {
        Self {
            payment,
            history,
            webhook_events: Vec::new(),
        }
    }

    pub fn with_webhook_events(mut self, events: Vec<WebhookEvent>) -> Self {
        self.webhook_events = events;
        self
    }

    /// The status the stored transaction is expected to have.
    pub fn expected_status(&self) -> PaymentStatus {
        self.history.previous_status
    }
}

/// A webhook event together with the claim that grants the right to attempt it.
#[derive(Debug, Clone)]
pub struct ClaimedWebhookEvent {
    pub event: WebhookEvent,
    pub claim: DeliveryClaim,
}

/// Core trait for payment persistence.
///
/// All implementations must be thread-safe (Send + Sync). Each method is
/// atomic on its own; nothing spans calls.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Stores a new transaction.
    ///
    /// Fails with `OrderAlreadyPaid` if the order already has a completed
    /// payment.
    async fn insert_payment(&self, payment: &PaymentTransaction) -> Result<()>;

    async fn get_payment(&self, id: PaymentId) -> Result<Option<PaymentTransaction>>;

    /// Returns every transaction for an order, oldest first.
    async fn find_payments_by_order(&self, order_id: OrderId) -> Result<Vec<PaymentTransaction>>;

    /// Returns up to `limit` transactions in `status`, oldest first.
    async fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>>;

    /// Commits a status change: the updated transaction, its history row and
    /// its webhook events, all or nothing.
    ///
    /// Fails with `ConcurrencyConflict` if the stored status differs from
    /// `record.expected_status()`, and with `OrderAlreadyPaid` if the change
    /// would give the order a second completed payment.
    async fn commit_transition(&self, record: TransitionRecord) -> Result<()>;

    /// Returns the status history of a payment, oldest first.
    async fn get_history(&self, payment_id: PaymentId) -> Result<Vec<PaymentStatusHistory>>;

    /// Stores new webhook events.
    async fn insert_webhook_events(&self, events: &[WebhookEvent]) -> Result<()>;

    async fn get_webhook_event(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>>;

    async fn list_webhook_events(&self, query: WebhookEventQuery) -> Result<Vec<WebhookEvent>>;

    /// Claims up to `limit` claimable events, earliest due first.
    ///
    /// Each claim lasts `lease`. An event with a live claim is never returned
    /// to a second caller.
    async fn claim_due_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: TimeDelta,
    ) -> Result<Vec<ClaimedWebhookEvent>>;

    /// Claims one specific event if it is claimable.
    async fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<ClaimedWebhookEvent>>;

    /// Stores the outcome of a delivery attempt.
    ///
    /// Fails with `ClaimLost` unless the stored event is still pending and
    /// held under `claim_token`.
    async fn complete_delivery_attempt(&self, event: &WebhookEvent, claim_token: Uuid)
    -> Result<()>;

    /// Cancels every still-pending event of a payment. Returns how many were
    /// cancelled.
    async fn cancel_pending_webhook_events(
        &self,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Extension trait providing convenience methods for repositories.
#[async_trait]
pub trait PaymentRepositoryExt: PaymentRepository {
    /// Loads a payment or fails with `NotFound`.
    async fn require_payment(&self, id: PaymentId) -> Result<PaymentTransaction> {
        self.get_payment(id)
            .await?
            .ok_or_else(|| crate::RepositoryError::payment_not_found(id))
    }

    /// Returns the completed payment of an order, if any.
    async fn completed_payment_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .find_payments_by_order(order_id)
            .await?
            .into_iter()
            .find(|p| p.status == PaymentStatus::Completed))
    }
}

// Blanket implementation for all PaymentRepository implementations
impl<T: PaymentRepository + ?Sized> PaymentRepositoryExt for T {}
