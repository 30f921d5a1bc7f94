//! Webhook delivery engine.
//!
//! Delivery follows claim-then-attempt: an event is claimed in the
//! repository under a token with a lease, attempted over the transport, and
//! the outcome is stored only if the same token still holds the claim. A
//! crash between a successful POST and the status update leaves the claim to
//! expire, after which the event is delivered again (at-least-once).

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use common::{PaymentId, WebhookEventId};
use domain::{PaymentTransaction, WebhookEvent, WebhookEventType};
use futures_util::StreamExt;
use futures_util::stream;
use repository::{ClaimedWebhookEvent, PaymentRepository, RepositoryError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::WebhookConfig;
use crate::payload::WebhookPayload;
use crate::transport::{DeliveryResult, WebhookRequest, WebhookTransport};
use crate::{Result, WebhookError};

/// What happened to an event after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed; another attempt is scheduled.
    Retrying { next_retry_at: DateTime<Utc> },
    /// Failed and out of attempts.
    Exhausted,
    /// The claim was lost before the outcome could be stored.
    ClaimLost,
}

/// Summary of one `retry_due` sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub exhausted: usize,
    pub claim_lost: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Retrying { .. } => self.retrying += 1,
            DeliveryOutcome::Exhausted => self.exhausted += 1,
            DeliveryOutcome::ClaimLost => self.claim_lost += 1,
        }
    }
}

/// Creates, stores and delivers webhook events.
///
/// Cloning is cheap; clones share the delivery pool.
#[derive(Clone)]
pub struct WebhookEngine<R, T> {
    repo: R,
    transport: T,
    config: Arc<WebhookConfig>,
    permits: Arc<Semaphore>,
}

impl<R, T> WebhookEngine<R, T>
where
    R: PaymentRepository + Clone + 'static,
    T: WebhookTransport + Clone + 'static,
{
    /// Creates a new engine with a delivery pool of `config.pool_size()` permits.
    pub fn new(repo: R, transport: T, config: WebhookConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size()));
        Self {
            repo,
            transport,
            config: Arc::new(config),
            permits,
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Returns the number of delivery slots currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Builds one pending event per configured endpoint, due immediately.
    ///
    /// Returns nothing when `event_type` is not notified. The events are not
    /// stored; the caller commits them, typically in the same unit as the
    /// status change they describe.
    pub fn prepare(
        &self,
        tx: &PaymentTransaction,
        event_type: WebhookEventType,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>> {
        if !self.config.notifies(event_type) || self.config.endpoints().is_empty() {
            return Ok(Vec::new());
        }

        let payload = WebhookPayload::snapshot(tx, event_type, now).to_value()?;
        Ok(self
            .config
            .endpoints()
            .iter()
            .map(|url| {
                WebhookEvent::new(
                    tx.id,
                    event_type,
                    payload.clone(),
                    url.clone(),
                    self.config.max_attempts(),
                    now,
                )
            })
            .collect())
    }

    /// Prepares, stores and dispatches the events for `tx`.
    #[tracing::instrument(skip(self, tx), fields(payment_id = %tx.id))]
    pub async fn emit(
        &self,
        tx: &PaymentTransaction,
        event_type: WebhookEventType,
    ) -> Result<Vec<WebhookEventId>> {
        let events = self.prepare(tx, event_type, Utc::now())?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        self.repo.insert_webhook_events(&events).await?;
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        self.dispatch(&ids);
        Ok(ids)
    }

    /// Starts attempts for freshly committed events using free pool slots.
    ///
    /// Events that find the pool saturated stay pending for the next sweep.
    pub fn dispatch(&self, ids: &[WebhookEventId]) {
        if !self.config.immediate_dispatch() {
            return;
        }

        for &id in ids {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!(event_id = %id, "delivery pool saturated, deferring to sweep");
                continue;
            };

            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.deliver_claimed_by_id(id, permit).await {
                    tracing::error!(
                        event_id = %id,
                        error = %e,
                        "immediate webhook delivery failed"
                    );
                }
            });
        }
    }

    async fn deliver_claimed_by_id(
        &self,
        id: WebhookEventId,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<DeliveryOutcome>> {
        let claimed = self
            .repo
            .claim_webhook_event(id, Utc::now(), self.lease())
            .await?;
        match claimed {
            Some(claimed) => Ok(Some(self.attempt(claimed, permit).await?)),
            None => Ok(None),
        }
    }

    /// Claims and attempts one event now, waiting for a pool slot.
    ///
    /// Returns `None` if the event is not currently claimable.
    pub async fn deliver_now(&self, id: WebhookEventId) -> Result<Option<DeliveryOutcome>> {
        let permit = self.acquire().await?;
        self.deliver_claimed_by_id(id, permit).await
    }

    /// Performs one POST for `event`, bounded by the request timeout.
    ///
    /// Does not touch the repository.
    pub async fn deliver(&self, event: &WebhookEvent) -> DeliveryResult {
        let request = WebhookRequest {
            url: event.endpoint_url.clone(),
            event_id: event.id,
            event_type: event.event_type,
            timestamp: Utc::now(),
            body: event.payload.clone(),
        };
        let timeout = self.config.request_timeout();

        match tokio::time::timeout(timeout, self.transport.send(&request, timeout)).await {
            Ok(result) => result,
            Err(_) => DeliveryResult::failed(format!("timed out after {timeout:?}")),
        }
    }

    /// Attempts a claimed event and stores the outcome under its claim.
    #[tracing::instrument(
        skip(self, claimed, _permit),
        fields(event_id = %claimed.event.id, attempt = claimed.event.attempts + 1)
    )]
    async fn attempt(
        &self,
        claimed: ClaimedWebhookEvent,
        _permit: OwnedSemaphorePermit,
    ) -> Result<DeliveryOutcome> {
        let ClaimedWebhookEvent { mut event, claim } = claimed;
        let result = self.deliver(&event).await;
        let now = Utc::now();

        if result.success {
            event.record_success(result.status_code.unwrap_or(200), now)?;
        } else {
            event.record_failure(
                result.status_code,
                result.error.clone().unwrap_or_else(|| "delivery failed".to_string()),
                self.config.backoff(),
                now,
            )?;
        }

        match self.repo.complete_delivery_attempt(&event, claim.token).await {
            Ok(()) => {}
            Err(RepositoryError::ClaimLost { .. }) => {
                tracing::warn!("claim lost before outcome was stored");
                metrics::counter!("webhook_deliveries_total", "outcome" => "claim_lost")
                    .increment(1);
                return Ok(DeliveryOutcome::ClaimLost);
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = if result.success {
            DeliveryOutcome::Delivered
        } else {
            match event.next_retry_at {
                Some(next_retry_at) => DeliveryOutcome::Retrying { next_retry_at },
                None => DeliveryOutcome::Exhausted,
            }
        };

        let label = match outcome {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Retrying { .. } => "retrying",
            DeliveryOutcome::Exhausted => "exhausted",
            DeliveryOutcome::ClaimLost => "claim_lost",
        };
        metrics::counter!("webhook_deliveries_total", "outcome" => label).increment(1);

        match outcome {
            DeliveryOutcome::Exhausted => tracing::warn!(
                status_code = ?result.status_code,
                error = ?result.error,
                "webhook delivery exhausted its attempts"
            ),
            _ => tracing::debug!(
                ?outcome,
                status_code = ?result.status_code,
                "webhook attempt finished"
            ),
        }

        Ok(outcome)
    }

    /// Claims due events and attempts them concurrently.
    ///
    /// At most `min(batch_size, free pool slots)` events are claimed, so a
    /// sweep never claims work it cannot start.
    #[tracing::instrument(skip(self))]
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let limit = self.config.batch_size().min(self.permits.available_permits());
        if limit == 0 {
            return Ok(SweepReport::default());
        }

        let claimed = self
            .repo
            .claim_due_webhook_events(now, limit, self.lease())
            .await?;
        metrics::histogram!("webhook_sweep_claimed").record(claimed.len() as f64);

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Result<DeliveryOutcome>> = stream::iter(claimed)
            .map(|claimed| async move {
                let permit = self.acquire().await?;
                self.attempt(claimed, permit).await
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => tracing::error!(error = %e, "webhook attempt could not be recorded"),
            }
        }

        tracing::info!(
            claimed = report.claimed,
            delivered = report.delivered,
            retrying = report.retrying,
            exhausted = report.exhausted,
            "webhook sweep complete"
        );
        Ok(report)
    }

    /// Cancels the still-pending events of a payment.
    ///
    /// Attempts already in flight finish, but their outcome is rejected.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_pending(&self, payment_id: PaymentId) -> Result<u64> {
        let cancelled = self
            .repo
            .cancel_pending_webhook_events(payment_id, Utc::now())
            .await?;
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending webhook events");
        }
        Ok(cancelled)
    }

    fn lease(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.claim_lease()).unwrap_or(TimeDelta::MAX)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WebhookError::PoolClosed)
    }
}
