use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{OrderId, PaymentId, WebhookEventId};
use domain::{
    DeliveryClaim, DeliveryStatus, PaymentStatus, PaymentStatusHistory, PaymentTransaction,
    WebhookEvent,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    RepositoryError, Result, WebhookEventQuery,
    store::{ClaimedWebhookEvent, PaymentRepository, TransitionRecord},
};

#[derive(Default)]
struct State {
    payments: HashMap<PaymentId, PaymentTransaction>,
    history: Vec<PaymentStatusHistory>,
    webhook_events: Vec<WebhookEvent>,
}

impl State {
    fn order_has_completed_payment(&self, order_id: OrderId, except: Option<PaymentId>) -> bool {
        self.payments.values().any(|p| {
            p.order_id == order_id && p.status == PaymentStatus::Completed && Some(p.id) != except
        })
    }

    fn claim(
        event: &mut WebhookEvent,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> ClaimedWebhookEvent {
        let claim = DeliveryClaim::new(now + lease);
        event.claim(claim, now);
        ClaimedWebhookEvent {
            event: event.clone(),
            claim,
        }
    }
}

/// In-memory repository implementation for testing and local runs.
///
/// All three record types live under one lock, so every write method is
/// atomic with respect to every other.
#[derive(Clone, Default)]
pub struct InMemoryPaymentRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryPaymentRepository {
    /// Creates a new empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored transactions.
    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Returns the number of stored webhook events.
    pub async fn webhook_event_count(&self) -> usize {
        self.state.read().await.webhook_events.len()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert_payment(&self, payment: &PaymentTransaction) -> Result<()> {
        let mut state = self.state.write().await;

        if state.order_has_completed_payment(payment.order_id, None) {
            return Err(RepositoryError::OrderAlreadyPaid {
                order_id: payment.order_id,
            });
        }

        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<PaymentTransaction>> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_payments_by_order(&self, order_id: OrderId) -> Result<Vec<PaymentTransaction>> {
        let state = self.state.read().await;
        let mut payments: Vec<_> = state
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>> {
        let state = self.state.read().await;
        let mut payments: Vec<_> = state
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments.truncate(limit);
        Ok(payments)
    }

    async fn commit_transition(&self, record: TransitionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let payment_id = record.payment.id;

        let actual = state
            .payments
            .get(&payment_id)
            .map(|p| p.status)
            .ok_or_else(|| RepositoryError::payment_not_found(payment_id))?;

        let expected = record.expected_status();
        if actual != expected {
            return Err(RepositoryError::ConcurrencyConflict {
                payment_id,
                expected,
                actual,
            });
        }

        // Unique index simulation
        if record.payment.status == PaymentStatus::Completed
            && state.order_has_completed_payment(record.payment.order_id, Some(payment_id))
        {
            return Err(RepositoryError::OrderAlreadyPaid {
                order_id: record.payment.order_id,
            });
        }

        state.payments.insert(payment_id, record.payment);
        state.history.push(record.history);
        state.webhook_events.extend(record.webhook_events);
        Ok(())
    }

    async fn get_history(&self, payment_id: PaymentId) -> Result<Vec<PaymentStatusHistory>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn insert_webhook_events(&self, events: &[WebhookEvent]) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(orphan) = events
            .iter()
            .find(|e| !state.payments.contains_key(&e.payment_id))
        {
            return Err(RepositoryError::payment_not_found(orphan.payment_id));
        }
        state.webhook_events.extend(events.iter().cloned());
        Ok(())
    }

    async fn get_webhook_event(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>> {
        let state = self.state.read().await;
        Ok(state.webhook_events.iter().find(|e| e.id == id).cloned())
    }

    async fn list_webhook_events(&self, query: WebhookEventQuery) -> Result<Vec<WebhookEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .webhook_events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);

        let offset = query.offset.unwrap_or(0);
        let events: Vec<_> = events.into_iter().skip(offset).collect();
        Ok(match query.limit {
            Some(limit) => events.into_iter().take(limit).collect(),
            None => events,
        })
    }

    async fn claim_due_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: TimeDelta,
    ) -> Result<Vec<ClaimedWebhookEvent>> {
        let mut state = self.state.write().await;

        let mut due: Vec<usize> = state
            .webhook_events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|i| state.webhook_events[*i].next_retry_at);
        due.truncate(limit);

        Ok(due
            .into_iter()
            .map(|i| State::claim(&mut state.webhook_events[i], now, lease))
            .collect())
    }

    async fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<ClaimedWebhookEvent>> {
        let mut state = self.state.write().await;
        let event = state
            .webhook_events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RepositoryError::webhook_event_not_found(id))?;

        if !event.is_claimable(now) {
            return Ok(None);
        }
        Ok(Some(State::claim(event, now, lease)))
    }

    async fn complete_delivery_attempt(
        &self,
        event: &WebhookEvent,
        claim_token: Uuid,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .webhook_events
            .iter_mut()
            .find(|e| e.id == event.id)
            .ok_or_else(|| RepositoryError::webhook_event_not_found(event.id))?;

        if stored.delivery_status.is_terminal() || !stored.holds_claim(claim_token) {
            return Err(RepositoryError::ClaimLost { event_id: event.id });
        }

        *stored = event.clone();
        stored.release_claim();
        Ok(())
    }

    async fn cancel_pending_webhook_events(
        &self,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut cancelled = 0;
        for event in state
            .webhook_events
            .iter_mut()
            .filter(|e| e.payment_id == payment_id && e.delivery_status == DeliveryStatus::Pending)
        {
            if event.cancel(now).is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PaymentRepositoryExt;
    use common::{PaymentMethodId, UserId};
    use domain::{
        BackoffSchedule, PaymentMethodType, PaymentRequest, StatusChange, WebhookEventType,
    };
    use serde_json::json;

    fn new_payment(order_id: OrderId) -> PaymentTransaction {
        let request = PaymentRequest {
            order_id,
            user_id: UserId::new(),
            payment_method_id: PaymentMethodId::new(),
            method_type: PaymentMethodType::CreditCard,
            amount: 5000,
            currency: "USD".to_string(),
            description: None,
            card: None,
        };
        PaymentTransaction::new(&request, Utc::now())
    }

    fn record(
        tx: &PaymentTransaction,
        target: PaymentStatus,
    ) -> (PaymentTransaction, TransitionRecord) {
        let (next, history) = tx
            .transition(target, StatusChange::new("test"), Utc::now())
            .unwrap();
        (next.clone(), TransitionRecord::new(next, history))
    }

    fn webhook(payment_id: PaymentId, now: DateTime<Utc>) -> WebhookEvent {
        WebhookEvent::new(
            payment_id,
            WebhookEventType::PaymentCompleted,
            json!({}),
            "http://hooks.local",
            5,
            now,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();

        assert_eq!(repo.get_payment(tx.id).await.unwrap(), Some(tx.clone()));
        assert_eq!(repo.payment_count().await, 1);
        assert!(repo.get_payment(PaymentId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_transition_checks_previous_status() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();

        let (_, first) = record(&tx, PaymentStatus::Processing);
        let (_, second) = record(&tx, PaymentStatus::Processing);
        repo.commit_transition(first).await.unwrap();

        let err = repo.commit_transition(second).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::ConcurrencyConflict {
                expected: PaymentStatus::Pending,
                actual: PaymentStatus::Processing,
                ..
            }
        ));
        assert_eq!(repo.get_history(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_commits_webhook_events_atomically() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();

        let (_, rec) = record(&tx, PaymentStatus::Cancelled);
        let rec = rec.with_webhook_events(vec![webhook(tx.id, Utc::now())]);
        repo.commit_transition(rec).await.unwrap();

        let stored = repo.require_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
        assert_eq!(repo.webhook_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_completion_per_order_is_rejected() {
        let repo = InMemoryPaymentRepository::new();
        let order_id = OrderId::new();
        let a = new_payment(order_id);
        let b = new_payment(order_id);
        repo.insert_payment(&a).await.unwrap();
        repo.insert_payment(&b).await.unwrap();

        for tx in [&a, &b] {
            let (processing, rec) = record(tx, PaymentStatus::Processing);
            repo.commit_transition(rec).await.unwrap();
            let (_, rec) = record(&processing, PaymentStatus::Completed);
            let result = repo.commit_transition(rec).await;
            if tx.id == a.id {
                result.unwrap();
            } else {
                assert!(matches!(
                    result,
                    Err(RepositoryError::OrderAlreadyPaid { .. })
                ));
            }
        }

        assert_eq!(
            repo.completed_payment_for_order(order_id)
                .await
                .unwrap()
                .map(|p| p.id),
            Some(a.id)
        );
        assert!(matches!(
            repo.insert_payment(&new_payment(order_id)).await,
            Err(RepositoryError::OrderAlreadyPaid { .. })
        ));
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_until_lease_expires() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();
        let now = Utc::now();
        repo.insert_webhook_events(&[webhook(tx.id, now), webhook(tx.id, now)])
            .await
            .unwrap();

        let lease = TimeDelta::seconds(30);
        let first = repo.claim_due_webhook_events(now, 10, lease).await.unwrap();
        let second = repo.claim_due_webhook_events(now, 10, lease).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());

        let later = now + lease;
        let reclaimed = repo.claim_due_webhook_events(later, 1, lease).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_requires_current_claim() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();
        let now = Utc::now();
        let ev = webhook(tx.id, now);
        repo.insert_webhook_events(std::slice::from_ref(&ev))
            .await
            .unwrap();

        let lease = TimeDelta::seconds(30);
        let stale = repo
            .claim_webhook_event(ev.id, now, lease)
            .await
            .unwrap()
            .unwrap();
        let fresh = repo
            .claim_webhook_event(ev.id, now + lease, lease)
            .await
            .unwrap()
            .unwrap();

        let mut attempt = stale.event.clone();
        attempt.record_success(200, now).unwrap();
        assert!(matches!(
            repo.complete_delivery_attempt(&attempt, stale.claim.token)
                .await,
            Err(RepositoryError::ClaimLost { .. })
        ));

        let mut attempt = fresh.event.clone();
        attempt
            .record_failure(Some(500), "HTTP 500", &BackoffSchedule::default(), now)
            .unwrap();
        repo.complete_delivery_attempt(&attempt, fresh.claim.token)
            .await
            .unwrap();

        let stored = repo.get_webhook_event(ev.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.claim_token.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_rejects_in_flight_completion() {
        let repo = InMemoryPaymentRepository::new();
        let tx = new_payment(OrderId::new());
        repo.insert_payment(&tx).await.unwrap();
        let now = Utc::now();
        let ev = webhook(tx.id, now);
        repo.insert_webhook_events(std::slice::from_ref(&ev))
            .await
            .unwrap();

        let claimed = repo
            .claim_webhook_event(ev.id, now, TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repo.cancel_pending_webhook_events(tx.id, now).await.unwrap(), 1);

        let mut attempt = claimed.event.clone();
        attempt.record_success(200, now).unwrap();
        assert!(
            repo.complete_delivery_attempt(&attempt, claimed.claim.token)
                .await
                .is_err()
        );

        let stored = repo.get_webhook_event(ev.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Cancelled);
    }
}
