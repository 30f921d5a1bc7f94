//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use processing::PaymentGateway;
use repository::PaymentRepository;
use serde::Serialize;
use webhooks::WebhookTransport;

use super::payments::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Free slots in the payment queue.
    pub payment_queue_capacity: usize,
    /// Free webhook delivery slots.
    pub webhook_slots_available: usize,
}

/// GET /health: returns system health status.
pub async fn check<R, G, T>(State(state): State<Arc<AppState<R, G, T>>>) -> Json<HealthResponse>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let status = if state.queue.is_closed() { "degraded" } else { "ok" };
    Json(HealthResponse {
        status,
        payment_queue_capacity: state.queue.capacity(),
        webhook_slots_available: state.processor.webhooks().available_permits(),
    })
}
