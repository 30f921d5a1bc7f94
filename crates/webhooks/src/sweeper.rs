//! Periodic retry loop.

use std::time::Duration;

use chrono::Utc;
use repository::PaymentRepository;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::WebhookEngine;
use crate::transport::WebhookTransport;

/// Calls [`WebhookEngine::retry_due`] on a fixed interval until shutdown.
pub struct WebhookSweeper<R, T> {
    engine: WebhookEngine<R, T>,
    interval: Duration,
}

impl<R, T> WebhookSweeper<R, T>
where
    R: PaymentRepository + Clone + 'static,
    T: WebhookTransport + Clone + 'static,
{
    /// Creates a sweeper using the engine's configured interval.
    pub fn new(engine: WebhookEngine<R, T>) -> Self {
        let interval = engine.config().sweep_interval();
        Self { engine, interval }
    }

    /// Runs the loop on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the loop until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.interval, "webhook sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.retry_due(Utc::now()).await {
                        tracing::error!(error = %e, "webhook sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("webhook sweeper stopped");
    }
}
