//! Payment request, lookup and lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::PaymentId;
use domain::{
    PaymentRequestInput, PaymentStatusHistory, PaymentTransaction, ValidationErrors, WebhookEvent,
};
use processing::{PaymentGateway, PaymentProcessor, ProcessingError};
use repository::PaymentRepository;
use serde::Deserialize;
use tokio::sync::mpsc;
use webhooks::WebhookTransport;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<R, G, T> {
    pub processor: Arc<PaymentProcessor<R, G, T>>,
    /// Queue feeding the payment worker pool.
    pub queue: mpsc::Sender<PaymentId>,
}

// -- Request types --

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Handlers --

/// POST /payments: validate and accept a payment request.
///
/// Responds 202 with the `PENDING` snapshot; a worker advances it.
/// Unreadable or mistyped bodies are reported as 422 violations.
#[tracing::instrument(skip(state, payload))]
pub async fn create<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentTransaction>), ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let Json(body) = payload.map_err(|rejection| {
        let mut errors = ValidationErrors::new();
        errors.push("body", "invalid_body", rejection.body_text());
        ApiError::Validation(errors)
    })?;
    let req = PaymentRequestInput::from_json(&body)?;

    let tx = state.processor.request_payment(&req).await?;

    state
        .queue
        .send(tx.id)
        .await
        .map_err(|_| ProcessingError::QueueClosed)?;

    Ok((StatusCode::ACCEPTED, Json(tx)))
}

/// GET /payments/{id}: load a payment.
#[tracing::instrument(skip(state))]
pub async fn get<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentTransaction>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    Ok(Json(state.processor.get_payment(payment_id).await?))
}

/// GET /payments/{id}/history: status history, oldest first.
#[tracing::instrument(skip(state))]
pub async fn history<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PaymentStatusHistory>>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    Ok(Json(state.processor.get_history(payment_id).await?))
}

/// GET /payments/{id}/webhooks: webhook events and their delivery state.
#[tracing::instrument(skip(state))]
pub async fn webhooks<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WebhookEvent>>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    Ok(Json(state.processor.list_webhook_events(payment_id).await?))
}

/// POST /payments/{id}/cancel: cancel a pending payment.
#[tracing::instrument(skip(state, body))]
pub async fn cancel<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PaymentTransaction>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    let reason = parse_reason(&body)?.unwrap_or_else(|| "cancelled by request".to_string());
    Ok(Json(state.processor.cancel(payment_id, reason).await?))
}

/// POST /payments/{id}/refund: refund a completed payment.
#[tracing::instrument(skip(state, body))]
pub async fn refund<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PaymentTransaction>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    let reason = parse_reason(&body)?.unwrap_or_else(|| "refunded by request".to_string());
    Ok(Json(state.processor.refund(payment_id, reason).await?))
}

/// POST /payments/{id}/retry: run a new processing pass for a failed payment.
#[tracing::instrument(skip(state))]
pub async fn retry<R, G, T>(
    State(state): State<Arc<AppState<R, G, T>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentTransaction>, ApiError>
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let payment_id = parse_payment_id(&id)?;
    Ok(Json(state.processor.retry(payment_id).await?))
}

// -- Helpers --

fn parse_payment_id(id: &str) -> Result<PaymentId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid payment id: {e}")))
}

/// An empty body means no reason was given.
fn parse_reason(body: &[u8]) -> Result<Option<String>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let req: ReasonRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
    Ok(req.reason.filter(|r| !r.trim().is_empty()))
}
