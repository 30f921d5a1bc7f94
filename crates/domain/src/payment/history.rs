use chrono::{DateTime, Utc};
use common::{HistoryId, PaymentId};
use serde::{Deserialize, Serialize};

use super::status::PaymentStatus;

/// One append-only audit row describing a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusHistory {
    pub id: HistoryId,
    pub payment_id: PaymentId,
    pub previous_status: PaymentStatus,
    pub new_status: PaymentStatus,
    pub reason: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PaymentStatusHistory {
    pub fn new(
        payment_id: PaymentId,
        previous_status: PaymentStatus,
        new_status: PaymentStatus,
        reason: impl Into<String>,
        context: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HistoryId::new(),
            payment_id,
            previous_status,
            new_status,
            reason: reason.into(),
            context,
            created_at,
        }
    }
}
