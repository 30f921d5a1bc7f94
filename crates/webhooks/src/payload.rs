//! Webhook request body and headers.

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId};
use domain::{PaymentStatus, PaymentTransaction, WebhookEventType};
use serde::{Deserialize, Serialize};

pub const HEADER_EVENT_TYPE: &str = "X-Webhook-Event-Type";
pub const HEADER_EVENT_ID: &str = "X-Webhook-Event-Id";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";

/// Body POSTed to every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: WebhookEventType,
    pub payment_id: PaymentId,
    pub timestamp: DateTime<Utc>,
    pub data: WebhookPayloadData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayloadData {
    pub order_id: OrderId,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl WebhookPayload {
    /// Snapshots the transaction as it stands at `timestamp`.
    pub fn snapshot(
        tx: &PaymentTransaction,
        event_type: WebhookEventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            payment_id: tx.id,
            timestamp,
            data: WebhookPayloadData {
                order_id: tx.order_id,
                amount: tx.amount,
                currency: tx.currency.clone(),
                status: tx.status,
                gateway_transaction_id: tx.gateway_transaction_id.clone(),
                failure_reason: tx.failure_reason.clone(),
                error_code: tx.error_code.clone(),
            },
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}
