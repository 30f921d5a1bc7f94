//! End-to-end payment lifecycle tests against the in-memory repository.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use domain::{
    DeliveryStatus, PaymentRequestInput, PaymentStatus, PaymentTransaction, Validator,
    WebhookEventType,
};
use processing::{
    DUPLICATE_ORDER_PAYMENT, GatewayOutcome, GatewaySimulator, GatewaySimulatorConfig,
    PaymentGateway, PaymentProcessor, PaymentWorkerPool, ProcessingError,
};
use repository::{InMemoryPaymentRepository, RepositoryError};
use tokio::sync::watch;
use webhooks::{InMemoryWebhookTransport, WebhookConfig, WebhookEngine};

/// Wraps the simulator and counts charges.
#[derive(Clone)]
struct CountingGateway {
    inner: GatewaySimulator,
    calls: Arc<AtomicUsize>,
}

impl CountingGateway {
    fn new(success_probability: f64, latency: Duration) -> Self {
        let config = GatewaySimulatorConfig::builder()
            .success_probability(success_probability)
            .latency(latency, latency)
            .rng_seed(42)
            .build()
            .unwrap();
        Self {
            inner: GatewaySimulator::new(config),
            calls: Arc::default(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for CountingGateway {
    async fn charge(&self, payment: &PaymentTransaction) -> GatewayOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.charge(payment).await
    }
}

type Processor =
    PaymentProcessor<InMemoryPaymentRepository, CountingGateway, InMemoryWebhookTransport>;

struct Harness {
    repo: InMemoryPaymentRepository,
    gateway: CountingGateway,
    transport: InMemoryWebhookTransport,
    processor: Arc<Processor>,
}

fn harness_with(success_probability: f64, latency: Duration, webhooks: WebhookConfig) -> Harness {
    let repo = InMemoryPaymentRepository::new();
    let gateway = CountingGateway::new(success_probability, latency);
    let transport = InMemoryWebhookTransport::new();
    let engine = WebhookEngine::new(repo.clone(), transport.clone(), webhooks);
    let processor = Arc::new(PaymentProcessor::new(
        repo.clone(),
        gateway.clone(),
        engine,
        Validator::default(),
    ));
    Harness {
        repo,
        gateway,
        transport,
        processor,
    }
}

fn webhook_config() -> WebhookConfig {
    WebhookConfig::builder()
        .endpoint("http://orders.local/webhooks/payments")
        .immediate_dispatch(false)
        .build()
        .unwrap()
}

fn harness(success_probability: f64) -> Harness {
    harness_with(success_probability, Duration::ZERO, webhook_config())
}

fn input(order_id: OrderId, amount: i64) -> PaymentRequestInput {
    PaymentRequestInput {
        order_id: order_id.to_string(),
        user_id: uuid::Uuid::new_v4().to_string(),
        payment_method_id: uuid::Uuid::new_v4().to_string(),
        amount,
        currency: "USD".to_string(),
        description: Some("order checkout".to_string()),
        method_type: Some("credit_card".to_string()),
        card: None,
    }
}

async fn requested(h: &Harness, amount: i64) -> PaymentTransaction {
    h.processor
        .request_payment(&input(OrderId::new(), amount))
        .await
        .unwrap()
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn amount_ending_01_fails_with_insufficient_funds() {
        let h = harness(1.0);
        let tx = requested(&h, 1501).await;
        assert_eq!(tx.status, PaymentStatus::Pending);

        let tx = h.processor.process(tx.id).await.unwrap();

        assert_eq!(tx.status, PaymentStatus::Failed);
        assert!(tx.failure_reason.as_deref().unwrap().contains("insufficient"));
        assert_eq!(tx.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
        assert!(tx.gateway_transaction_id.is_none());

        let events = h.processor.list_webhook_events(tx.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WebhookEventType::PaymentFailed);
        assert_eq!(events[0].payload["data"]["error_code"], "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn certain_success_completes_with_one_event() {
        let h = harness(1.0);
        let tx = requested(&h, 5000).await;

        let tx = h.processor.process(tx.id).await.unwrap();

        assert_eq!(tx.status, PaymentStatus::Completed);
        let receipt = tx.gateway_transaction_id.clone().unwrap();
        assert!(receipt.contains("_txn_"));
        assert!(tx.processed_at.is_some());
        assert_eq!(tx.attempt_count, 1);

        let events = h.processor.list_webhook_events(tx.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WebhookEventType::PaymentCompleted);
        assert_eq!(events[0].delivery_status, DeliveryStatus::Pending);

        let history = h.processor.get_history(tx.id).await.unwrap();
        let steps: Vec<_> = history
            .iter()
            .map(|h| (h.previous_status, h.new_status))
            .collect();
        assert_eq!(
            steps,
            vec![
                (PaymentStatus::Pending, PaymentStatus::Processing),
                (PaymentStatus::Processing, PaymentStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn completed_event_is_delivered_by_sweep() {
        let h = harness(1.0);
        let tx = requested(&h, 5000).await;
        let tx = h.processor.process(tx.id).await.unwrap();

        let report = h.processor.webhooks().retry_due(Utc::now()).await.unwrap();
        assert_eq!(report.delivered, 1);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["data"]["status"], "COMPLETED");
        assert_eq!(
            requests[0].body["data"]["gateway_transaction_id"],
            tx.gateway_transaction_id.unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_request_lists_every_field() {
        let h = harness(1.0);
        let mut bad = input(OrderId::new(), 0);
        bad.currency = "XYZ".to_string();
        bad.user_id = "nope".to_string();

        let err = h.processor.request_payment(&bad).await.unwrap_err();
        let ProcessingError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(errors.has_code("min_amount"));
        assert!(errors.has_code("unsupported_currency"));
        assert!(errors.has_code("invalid_uuid"));
        assert_eq!(h.repo.payment_count().await, 0);
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn concurrent_process_charges_once() {
        let h = harness_with(1.0, Duration::from_millis(30), webhook_config());
        let tx = requested(&h, 5000).await;

        let (a, b) = tokio::join!(h.processor.process(tx.id), h.processor.process(tx.id));

        let (ok, err) = match (a, b) {
            (Ok(tx), Err(e)) | (Err(e), Ok(tx)) => (tx, e),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        assert_eq!(ok.status, PaymentStatus::Completed);
        assert!(err.is_conflict());
        assert_eq!(h.gateway.calls(), 1);

        let history = h.processor.get_history(tx.id).await.unwrap();
        let processing_rows = history
            .iter()
            .filter(|h| h.new_status == PaymentStatus::Processing)
            .count();
        assert_eq!(processing_rows, 1);
    }

    #[tokio::test]
    async fn second_payment_for_paid_order_is_refused() {
        let h = harness(1.0);
        let order_id = OrderId::new();
        let first = h
            .processor
            .request_payment(&input(order_id, 5000))
            .await
            .unwrap();
        h.processor.process(first.id).await.unwrap();

        let err = h
            .processor
            .request_payment(&input(order_id, 5000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Repository(RepositoryError::OrderAlreadyPaid { .. })
        ));
    }

    #[tokio::test]
    async fn queued_duplicate_fails_without_charging() {
        let h = harness(1.0);
        let order_id = OrderId::new();
        let first = h
            .processor
            .request_payment(&input(order_id, 5000))
            .await
            .unwrap();
        let second = h
            .processor
            .request_payment(&input(order_id, 5000))
            .await
            .unwrap();

        h.processor.process(first.id).await.unwrap();
        let second = h.processor.process(second.id).await.unwrap();

        assert_eq!(second.status, PaymentStatus::Failed);
        assert_eq!(second.error_code.as_deref(), Some(DUPLICATE_ORDER_PAYMENT));
        assert_eq!(h.gateway.calls(), 1);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let h = harness(1.0);
        let tx = requested(&h, 5000).await;

        let cancelled = h.processor.cancel(tx.id, "customer abandoned cart").await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);

        let events = h.processor.list_webhook_events(tx.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WebhookEventType::PaymentCancelled);

        let err = h.processor.process(tx.id).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Transition(_)));
        let stored = h.processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn refund_only_from_completed() {
        let h = harness(1.0);
        let tx = requested(&h, 5000).await;

        let err = h.processor.refund(tx.id, "too early").await.unwrap_err();
        assert!(matches!(err, ProcessingError::Transition(_)));

        h.processor.process(tx.id).await.unwrap();
        let refunded = h.processor.refund(tx.id, "item returned").await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);

        let types: Vec<_> = h
            .processor
            .list_webhook_events(tx.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                WebhookEventType::PaymentCompleted,
                WebhookEventType::PaymentRefunded
            ]
        );
    }

    #[tokio::test]
    async fn retry_starts_a_new_pass_from_failed() {
        let h = harness(1.0);
        let tx = requested(&h, 1502).await;

        let err = h.processor.retry(tx.id).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Transition(_)));

        let failed = h.processor.process(tx.id).await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("CARD_DECLINED"));

        let retried = h.processor.retry(tx.id).await.unwrap();
        assert_eq!(retried.status, PaymentStatus::Failed);
        assert_eq!(retried.attempt_count, 2);
        assert_eq!(h.gateway.calls(), 2);

        let history = h.processor.get_history(tx.id).await.unwrap();
        assert!(history.iter().any(|h| {
            h.previous_status == PaymentStatus::Failed && h.new_status == PaymentStatus::Processing
        }));
    }

    #[tokio::test]
    async fn unnotified_terminal_state_cancels_pending_events() {
        let config = WebhookConfig::builder()
            .endpoint("http://orders.local/webhooks/payments")
            .notify_on([WebhookEventType::PaymentCompleted])
            .immediate_dispatch(false)
            .build()
            .unwrap();
        let h = harness_with(1.0, Duration::ZERO, config);
        let tx = requested(&h, 5000).await;
        h.processor.process(tx.id).await.unwrap();

        h.processor.refund(tx.id, "item returned").await.unwrap();

        let events = h.processor.list_webhook_events(tx.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delivery_status, DeliveryStatus::Cancelled);
        let report = h.processor.webhooks().retry_due(Utc::now()).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let h = harness(1.0);
        let err = h
            .processor
            .get_payment(common::PaymentId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Repository(RepositoryError::NotFound { .. })
        ));
    }
}

mod workers {
    use super::*;

    #[tokio::test]
    async fn pool_processes_resumed_payments() {
        let h = harness(1.0);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(requested(&h, 5000).await.id);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = PaymentWorkerPool::spawn(h.processor.clone(), 2, 16, shutdown_rx);
        assert_eq!(pool.resume_pending(100).await.unwrap(), 3);

        let mut done = false;
        for _ in 0..200 {
            let mut completed = 0;
            for id in &ids {
                if h.processor.get_payment(*id).await.unwrap().status == PaymentStatus::Completed {
                    completed += 1;
                }
            }
            if completed == ids.len() {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);
        assert_eq!(h.gateway.calls(), 3);

        shutdown_tx.send(true).unwrap();
        pool.join().await;
    }

    #[tokio::test]
    async fn closed_pool_rejects_enqueue() {
        let h = harness(1.0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = PaymentWorkerPool::spawn(h.processor.clone(), 1, 4, shutdown_rx);
        let sender = pool.sender();

        shutdown_tx.send(true).unwrap();
        pool.join().await;

        assert!(sender.send(common::PaymentId::new()).await.is_err());
    }
}

mod recovery {
    use super::*;
    use chrono::{DateTime, TimeDelta};
    use common::{PaymentId, WebhookEventId};
    use domain::{PaymentStatusHistory, WebhookEvent};
    use processing::PROCESSING_INTERRUPTED;
    use repository::{ClaimedWebhookEvent, PaymentRepository, TransitionRecord, WebhookEventQuery};

    /// In-memory repository whose writes out of `PROCESSING` and order
    /// lookups can be made to fail with a backend error.
    #[derive(Clone, Default)]
    struct FlakyRepository {
        inner: InMemoryPaymentRepository,
        commit_failures: Arc<AtomicUsize>,
        lookup_failures: Arc<AtomicUsize>,
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn backend_error() -> RepositoryError {
        RepositoryError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl PaymentRepository for FlakyRepository {
        async fn insert_payment(&self, payment: &PaymentTransaction) -> repository::Result<()> {
            self.inner.insert_payment(payment).await
        }

        async fn get_payment(
            &self,
            id: PaymentId,
        ) -> repository::Result<Option<PaymentTransaction>> {
            self.inner.get_payment(id).await
        }

        async fn find_payments_by_order(
            &self,
            order_id: OrderId,
        ) -> repository::Result<Vec<PaymentTransaction>> {
            if take(&self.lookup_failures) {
                return Err(backend_error());
            }
            self.inner.find_payments_by_order(order_id).await
        }

        async fn list_payments_by_status(
            &self,
            status: PaymentStatus,
            limit: usize,
        ) -> repository::Result<Vec<PaymentTransaction>> {
            self.inner.list_payments_by_status(status, limit).await
        }

        async fn commit_transition(&self, record: TransitionRecord) -> repository::Result<()> {
            if record.expected_status() == PaymentStatus::Processing
                && take(&self.commit_failures)
            {
                return Err(backend_error());
            }
            self.inner.commit_transition(record).await
        }

        async fn get_history(
            &self,
            payment_id: PaymentId,
        ) -> repository::Result<Vec<PaymentStatusHistory>> {
            self.inner.get_history(payment_id).await
        }

        async fn insert_webhook_events(&self, events: &[WebhookEvent]) -> repository::Result<()> {
            self.inner.insert_webhook_events(events).await
        }

        async fn get_webhook_event(
            &self,
            id: WebhookEventId,
        ) -> repository::Result<Option<WebhookEvent>> {
            self.inner.get_webhook_event(id).await
        }

        async fn list_webhook_events(
            &self,
            query: WebhookEventQuery,
        ) -> repository::Result<Vec<WebhookEvent>> {
            self.inner.list_webhook_events(query).await
        }

        async fn claim_due_webhook_events(
            &self,
            now: DateTime<Utc>,
            limit: usize,
            lease: TimeDelta,
        ) -> repository::Result<Vec<ClaimedWebhookEvent>> {
            self.inner.claim_due_webhook_events(now, limit, lease).await
        }

        async fn claim_webhook_event(
            &self,
            id: WebhookEventId,
            now: DateTime<Utc>,
            lease: TimeDelta,
        ) -> repository::Result<Option<ClaimedWebhookEvent>> {
            self.inner.claim_webhook_event(id, now, lease).await
        }

        async fn complete_delivery_attempt(
            &self,
            event: &WebhookEvent,
            claim_token: uuid::Uuid,
        ) -> repository::Result<()> {
            self.inner.complete_delivery_attempt(event, claim_token).await
        }

        async fn cancel_pending_webhook_events(
            &self,
            payment_id: PaymentId,
            now: DateTime<Utc>,
        ) -> repository::Result<u64> {
            self.inner.cancel_pending_webhook_events(payment_id, now).await
        }
    }

    type FlakyProcessor =
        PaymentProcessor<FlakyRepository, CountingGateway, InMemoryWebhookTransport>;

    fn flaky_processor() -> (FlakyRepository, CountingGateway, Arc<FlakyProcessor>) {
        let repo = FlakyRepository::default();
        let gateway = CountingGateway::new(1.0, Duration::ZERO);
        let engine =
            WebhookEngine::new(repo.clone(), InMemoryWebhookTransport::new(), webhook_config());
        let processor = Arc::new(PaymentProcessor::new(
            repo.clone(),
            gateway.clone(),
            engine,
            Validator::default(),
        ));
        (repo, gateway, processor)
    }

    async fn pending(processor: &FlakyProcessor) -> PaymentTransaction {
        processor
            .request_payment(&input(OrderId::new(), 5000))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn transient_outcome_commit_failure_is_retried() {
        let (repo, gateway, processor) = flaky_processor();
        let tx = pending(&processor).await;
        repo.commit_failures.store(1, Ordering::SeqCst);

        let tx = processor.process(tx.id).await.unwrap();

        assert_eq!(tx.status, PaymentStatus::Completed);
        assert_eq!(gateway.calls(), 1);
        let stored = processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(processor.get_history(tx.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lookup_failure_before_charge_fails_the_pass() {
        let (repo, gateway, processor) = flaky_processor();
        let tx = pending(&processor).await;
        repo.lookup_failures.store(1, Ordering::SeqCst);

        let err = processor.process(tx.id).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Repository(RepositoryError::Database(_))
        ));
        assert_eq!(gateway.calls(), 0);

        let stored = processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some(PROCESSING_INTERRUPTED));

        let retried = processor.retry(tx.id).await.unwrap();
        assert_eq!(retried.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn abandoned_pass_is_failed_on_resume_and_can_be_retried() {
        let (repo, gateway, processor) = flaky_processor();
        let tx = pending(&processor).await;
        repo.commit_failures.store(usize::MAX, Ordering::SeqCst);

        let err = processor.process(tx.id).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Repository(RepositoryError::Database(_))
        ));
        let stored = processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);

        repo.commit_failures.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = PaymentWorkerPool::spawn(processor.clone(), 1, 4, shutdown_rx);
        assert_eq!(pool.resume_pending(100).await.unwrap(), 0);

        let stored = processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some(PROCESSING_INTERRUPTED));

        let retried = processor.retry(tx.id).await.unwrap();
        assert_eq!(retried.status, PaymentStatus::Completed);
        assert_eq!(retried.attempt_count, 2);
        assert_eq!(gateway.calls(), 2);

        shutdown_tx.send(true).unwrap();
        pool.join().await;
    }

    #[tokio::test]
    async fn recovery_skips_passes_started_after_cutoff() {
        let (repo, _, processor) = flaky_processor();
        let tx = pending(&processor).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        repo.commit_failures.store(usize::MAX, Ordering::SeqCst);
        processor.process(tx.id).await.unwrap_err();

        assert_eq!(processor.recover_interrupted(cutoff, 10).await.unwrap(), 0);
        let stored = processor.get_payment(tx.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);
    }
}
