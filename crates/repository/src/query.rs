use common::PaymentId;
use domain::{DeliveryStatus, WebhookEventType};

/// Filter for listing webhook events.
///
/// Results are ordered by creation time, oldest first.
#[derive(Debug, Clone, Default)]
pub struct WebhookEventQuery {
    /// Filter by payment.
    pub payment_id: Option<PaymentId>,

    /// Filter by delivery status.
    pub delivery_status: Option<DeliveryStatus>,

    /// Filter by event type.
    pub event_type: Option<WebhookEventType>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Number of events to skip.
    pub offset: Option<usize>,
}

impl WebhookEventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for the events of one payment.
    pub fn for_payment(payment_id: PaymentId) -> Self {
        Self {
            payment_id: Some(payment_id),
            ..Default::default()
        }
    }

    pub fn delivery_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = Some(status);
        self
    }

    pub fn event_type(mut self, event_type: WebhookEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if `event` passes every filter (ignores paging).
    pub fn matches(&self, event: &domain::WebhookEvent) -> bool {
        if let Some(payment_id) = self.payment_id
            && event.payment_id != payment_id
        {
            return false;
        }
        if let Some(status) = self.delivery_status
            && event.delivery_status != status
        {
            return false;
        }
        if let Some(event_type) = self.event_type
            && event.event_type != event_type
        {
            return false;
        }
        true
    }
}
