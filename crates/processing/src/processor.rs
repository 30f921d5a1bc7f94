//! Payment processor: drives transactions through the state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::PaymentId;
use domain::{
    PaymentRequestInput, PaymentStatus, PaymentStatusHistory, PaymentTransaction, StatusChange,
    TransitionError, Validator, WebhookEvent, WebhookEventType,
};
use repository::{
    PaymentRepository, PaymentRepositoryExt, RepositoryError, TransitionRecord, WebhookEventQuery,
};
use serde_json::json;
use webhooks::{WebhookEngine, WebhookTransport};

use crate::error::{ProcessingError, Result};
use crate::gateway::{GatewayOutcome, PaymentGateway};

/// Error code recorded when an order already has a completed payment.
pub const DUPLICATE_ORDER_PAYMENT: &str = "DUPLICATE_ORDER_PAYMENT";

/// Error code recorded when a processing pass stopped before its outcome
/// could be stored.
pub const PROCESSING_INTERRUPTED: &str = "PROCESSING_INTERRUPTED";

const OUTCOME_COMMIT_ATTEMPTS: u32 = 3;
const OUTCOME_COMMIT_BACKOFF: Duration = Duration::from_millis(50);

/// Applies payment requests and status changes.
///
/// Every status change is committed together with its history row and the
/// webhook events it produces. The repository's compare-and-set on the
/// previous status serializes concurrent writers per transaction.
pub struct PaymentProcessor<R, G, T> {
    repo: R,
    gateway: G,
    webhooks: WebhookEngine<R, T>,
    validator: Validator,
}

impl<R, G, T> PaymentProcessor<R, G, T>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway,
    T: WebhookTransport + Clone + 'static,
{
    pub fn new(repo: R, gateway: G, webhooks: WebhookEngine<R, T>, validator: Validator) -> Self {
        Self {
            repo,
            gateway,
            webhooks,
            validator,
        }
    }

    pub fn webhooks(&self) -> &WebhookEngine<R, T> {
        &self.webhooks
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validates a request and stores it as a `PENDING` transaction.
    ///
    /// Refuses orders that already have a completed payment.
    #[tracing::instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn request_payment(&self, input: &PaymentRequestInput) -> Result<PaymentTransaction> {
        let request = self.validator.validate_payment_request(input)?;

        if self
            .repo
            .completed_payment_for_order(request.order_id)
            .await?
            .is_some()
        {
            return Err(RepositoryError::OrderAlreadyPaid {
                order_id: request.order_id,
            }
            .into());
        }

        let tx = PaymentTransaction::new(&request, Utc::now());
        self.repo.insert_payment(&tx).await?;

        metrics::counter!("payments_requested_total", "method" => tx.method_type.as_str())
            .increment(1);
        tracing::info!(
            payment_id = %tx.id,
            amount = tx.amount,
            currency = %tx.currency,
            "payment requested"
        );
        Ok(tx)
    }

    /// Moves `tx` to `target` and commits the change.
    ///
    /// On success `tx` holds the new state. On any error `tx` is unchanged.
    #[tracing::instrument(skip(self, tx, change), fields(payment_id = %tx.id, from = %tx.status))]
    pub async fn apply_transition(
        &self,
        tx: &mut PaymentTransaction,
        target: PaymentStatus,
        change: StatusChange,
    ) -> Result<()> {
        let now = Utc::now();
        let (next, history) = match tx.transition(target, change, now) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(to = %target, "rejected status change");
                return Err(e.into());
            }
        };

        let event_type = WebhookEventType::for_status(target);
        let events = match event_type {
            Some(event_type) => self.webhooks.prepare(&next, event_type, now)?,
            None => Vec::new(),
        };
        let event_ids: Vec<_> = events.iter().map(|e| e.id).collect();

        let record = TransitionRecord::new(next.clone(), history).with_webhook_events(events);
        self.repo.commit_transition(record).await?;

        let from = tx.status;
        *tx = next;

        metrics::counter!(
            "payment_transitions_total",
            "from" => from.as_str(),
            "to" => target.as_str()
        )
        .increment(1);
        tracing::info!(to = %target, "payment status changed");

        self.webhooks.dispatch(&event_ids);

        if target.is_terminal()
            && event_type.is_none_or(|event_type| !self.webhooks.config().notifies(event_type))
            && let Err(e) = self.webhooks.cancel_pending(tx.id).await
        {
            tracing::warn!(error = %e, "could not cancel pending webhook events");
        }

        Ok(())
    }

    /// Runs one processing pass: `PROCESSING`, a gateway charge, then
    /// `COMPLETED` or `FAILED`.
    ///
    /// Starts from `PENDING` or `FAILED`. A caller that loses the race to
    /// start the pass gets a conflict error and the gateway is not called.
    /// A storage failure before the charge ends the pass as `FAILED` with
    /// [`PROCESSING_INTERRUPTED`]. Committing the charge outcome is retried
    /// while the storage failure is transient.
    #[tracing::instrument(skip(self))]
    pub async fn process(&self, payment_id: PaymentId) -> Result<PaymentTransaction> {
        let mut tx = self.repo.require_payment(payment_id).await?;
        let attempt = tx.attempt_count + 1;

        self.apply_transition(
            &mut tx,
            PaymentStatus::Processing,
            StatusChange::new("processing started").with_context(json!({ "attempt": attempt })),
        )
        .await?;

        let duplicate = match self.repo.completed_payment_for_order(tx.order_id).await {
            Ok(existing) => existing.filter(|p| p.id != tx.id),
            Err(e) => {
                self.fail_interrupted(&mut tx, &e).await;
                return Err(e.into());
            }
        };
        if let Some(existing) = duplicate {
            self.fail_duplicate(&mut tx, Some(existing.id)).await?;
            return Ok(tx);
        }

        let outcome = self.gateway.charge(&tx).await;
        let target = if outcome.success {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };
        self.commit_outcome(&mut tx, target, outcome_change(&outcome))
            .await?;

        Ok(tx)
    }

    /// Commits the result of a charge.
    ///
    /// Transient storage failures are retried. If an earlier attempt was in
    /// fact stored, the lost compare-and-set is resolved by reloading.
    async fn commit_outcome(
        &self,
        tx: &mut PaymentTransaction,
        target: PaymentStatus,
        change: StatusChange,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.apply_transition(tx, target, change.clone()).await {
                Ok(()) => return Ok(()),
                Err(ProcessingError::Repository(RepositoryError::OrderAlreadyPaid { .. })) => {
                    tracing::warn!("order was paid by another transaction during authorization");
                    let existing = self
                        .repo
                        .completed_payment_for_order(tx.order_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|p| p.id);
                    return self.fail_duplicate(tx, existing).await;
                }
                Err(ProcessingError::Repository(RepositoryError::ConcurrencyConflict {
                    actual,
                    ..
                })) if attempt > 1 && actual == target => {
                    *tx = self.repo.require_payment(tx.id).await?;
                    return Ok(());
                }
                Err(ProcessingError::Repository(e))
                    if e.is_transient() && attempt < OUTCOME_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(attempt, error = %e, "retrying outcome commit");
                    tokio::time::sleep(OUTCOME_COMMIT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail_duplicate(
        &self,
        tx: &mut PaymentTransaction,
        existing: Option<PaymentId>,
    ) -> Result<()> {
        let change = StatusChange::new("order already paid")
            .with_failure("order already has a completed payment", DUPLICATE_ORDER_PAYMENT)
            .with_context(json!({ "completed_payment_id": existing }));
        self.apply_transition(tx, PaymentStatus::Failed, change).await
    }

    /// Records a pass that stopped before its outcome was known.
    ///
    /// Best effort: a failure here is logged and the payment stays in
    /// `PROCESSING` until [`PaymentProcessor::recover_interrupted`] runs.
    async fn fail_interrupted(&self, tx: &mut PaymentTransaction, cause: &RepositoryError) {
        let change = StatusChange::new("processing interrupted")
            .with_failure("processing was interrupted", PROCESSING_INTERRUPTED)
            .with_context(json!({ "cause": cause.to_string() }));
        if let Err(e) = self.apply_transition(tx, PaymentStatus::Failed, change).await {
            tracing::error!(error = %e, "could not record interrupted payment");
        }
    }

    /// Fails payments that have been `PROCESSING` since before `cutoff`.
    ///
    /// Such a pass was abandoned, e.g. by a restart. The payment becomes
    /// `FAILED` with [`PROCESSING_INTERRUPTED`] and can be retried. Returns
    /// how many payments were recovered.
    #[tracing::instrument(skip(self))]
    pub async fn recover_interrupted(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let stuck = self
            .repo
            .list_payments_by_status(PaymentStatus::Processing, limit)
            .await?;

        let mut recovered = 0;
        for mut tx in stuck.into_iter().filter(|tx| tx.updated_at < cutoff) {
            let change = StatusChange::new("processing interrupted")
                .with_failure("processing was interrupted", PROCESSING_INTERRUPTED)
                .with_context(json!({ "stale_since": tx.updated_at }));
            match self.apply_transition(&mut tx, PaymentStatus::Failed, change).await {
                Ok(()) => recovered += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    tracing::error!(payment_id = %tx.id, error = %e, "could not recover payment");
                }
            }
        }

        if recovered > 0 {
            tracing::warn!(recovered, "failed interrupted payments");
        }
        Ok(recovered)
    }

    /// Retries a `FAILED` payment.
    pub async fn retry(&self, payment_id: PaymentId) -> Result<PaymentTransaction> {
        let tx = self.repo.require_payment(payment_id).await?;
        if tx.status != PaymentStatus::Failed {
            return Err(TransitionError::InvalidTransition {
                payment_id,
                from: tx.status,
                to: PaymentStatus::Processing,
            }
            .into());
        }
        self.process(payment_id).await
    }

    /// Cancels a `PENDING` payment.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        payment_id: PaymentId,
        reason: impl Into<String>,
    ) -> Result<PaymentTransaction> {
        let mut tx = self.repo.require_payment(payment_id).await?;
        self.apply_transition(&mut tx, PaymentStatus::Cancelled, StatusChange::new(reason))
            .await?;
        Ok(tx)
    }

    /// Refunds a `COMPLETED` payment.
    #[tracing::instrument(skip(self, reason))]
    pub async fn refund(
        &self,
        payment_id: PaymentId,
        reason: impl Into<String>,
    ) -> Result<PaymentTransaction> {
        let mut tx = self.repo.require_payment(payment_id).await?;
        self.apply_transition(&mut tx, PaymentStatus::Refunded, StatusChange::new(reason))
            .await?;
        Ok(tx)
    }

    pub async fn get_payment(&self, payment_id: PaymentId) -> Result<PaymentTransaction> {
        Ok(self.repo.require_payment(payment_id).await?)
    }

    /// Returns the status history of a payment, oldest first.
    pub async fn get_history(&self, payment_id: PaymentId) -> Result<Vec<PaymentStatusHistory>> {
        self.repo.require_payment(payment_id).await?;
        Ok(self.repo.get_history(payment_id).await?)
    }

    pub async fn list_webhook_events(&self, payment_id: PaymentId) -> Result<Vec<WebhookEvent>> {
        self.repo.require_payment(payment_id).await?;
        Ok(self
            .repo
            .list_webhook_events(WebhookEventQuery::for_payment(payment_id))
            .await?)
    }

    /// Returns up to `limit` payments in `status`, oldest first.
    pub async fn list_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>> {
        Ok(self.repo.list_payments_by_status(status, limit).await?)
    }
}

fn outcome_change(outcome: &GatewayOutcome) -> StatusChange {
    let context = json!({
        "gateway_id": outcome.gateway_id,
        "latency_ms": u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX),
    });

    match (&outcome.receipt_id, outcome.failure_class) {
        (Some(receipt), _) if outcome.success => StatusChange::new("payment authorized")
            .with_gateway(&outcome.gateway_id)
            .with_receipt(receipt)
            .with_context(context),
        (_, Some(class)) => StatusChange::new("payment declined")
            .with_gateway(&outcome.gateway_id)
            .with_failure(class.reason(), class.error_code())
            .with_context(context),
        _ => StatusChange::new("payment declined")
            .with_gateway(&outcome.gateway_id)
            .with_failure(
                "gateway returned no result",
                outcome.error_code.as_deref().unwrap_or("GATEWAY_ERROR"),
            )
            .with_context(context),
    }
}
