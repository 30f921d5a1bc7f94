//! Background worker pool that processes queued payments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::PaymentId;
use domain::PaymentStatus;
use repository::PaymentRepository;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use webhooks::WebhookTransport;

use crate::error::{ProcessingError, Result};
use crate::gateway::PaymentGateway;
use crate::processor::PaymentProcessor;

/// Queue length used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A fixed set of tasks sharing one queue of payment ids.
///
/// Each dequeued payment gets one [`PaymentProcessor::process`] pass. Workers
/// stop when shutdown is signalled or every sender is gone.
pub struct PaymentWorkerPool<R, G, T> {
    processor: Arc<PaymentProcessor<R, G, T>>,
    sender: mpsc::Sender<PaymentId>,
    handles: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

impl<R, G, T> PaymentWorkerPool<R, G, T>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    /// Spawns `workers` tasks (at least one).
    pub fn spawn(
        processor: Arc<PaymentProcessor<R, G, T>>,
        workers: usize,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let started_at = Utc::now();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    processor.clone(),
                    receiver.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = workers.max(1), "payment worker pool started");
        Self {
            processor,
            sender,
            handles,
            started_at,
        }
    }

    /// Queues a payment for processing, waiting while the queue is full.
    pub async fn enqueue(&self, payment_id: PaymentId) -> Result<()> {
        self.sender
            .send(payment_id)
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }

    /// Returns a handle that can queue payments from elsewhere.
    pub fn sender(&self) -> mpsc::Sender<PaymentId> {
        self.sender.clone()
    }

    /// Re-queues payments left `PENDING`, e.g. by a restart.
    ///
    /// Payments left `PROCESSING` since before the pool started are failed
    /// first so they can be retried. Returns how many were queued.
    pub async fn resume_pending(&self, limit: usize) -> Result<usize> {
        self.processor
            .recover_interrupted(self.started_at, limit)
            .await?;

        let pending = self
            .processor
            .list_by_status(PaymentStatus::Pending, limit)
            .await?;
        let count = pending.len();
        for payment in pending {
            self.enqueue(payment.id).await?;
        }
        if count > 0 {
            tracing::info!(count, "resumed pending payments");
        }
        Ok(count)
    }

    /// Closes the queue and waits for every worker to finish.
    ///
    /// Queued payments are still processed unless shutdown was signalled.
    pub async fn join(self) {
        drop(self.sender);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "payment worker panicked");
            }
        }
    }
}

async fn run_worker<R, G, T>(
    worker: usize,
    processor: Arc<PaymentProcessor<R, G, T>>,
    receiver: Arc<Mutex<mpsc::Receiver<PaymentId>>>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                payment_id = receiver.recv() => payment_id,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        None
                    } else {
                        continue;
                    }
                }
            }
        };
        let Some(payment_id) = next else {
            break;
        };

        match processor.process(payment_id).await {
            Ok(tx) => {
                tracing::debug!(worker, %payment_id, status = %tx.status, "payment processed");
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(worker, %payment_id, error = %e, "payment already being processed");
            }
            Err(e) => tracing::error!(worker, %payment_id, error = %e, "payment processing failed"),
        }
    }

    tracing::debug!(worker, "payment worker stopped");
}
