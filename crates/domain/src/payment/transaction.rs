//! Payment transaction record and its transition logic.

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, PaymentMethodId, UserId};
use serde::{Deserialize, Serialize};

use super::history::PaymentStatusHistory;
use super::status::PaymentStatus;
use crate::error::{ParseError, TransitionError};

/// Kind of instrument behind a payment method reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentMethodType {
    #[default]
    #[serde(rename = "credit_card")]
    CreditCard,
    #[serde(rename = "debit_card")]
    DebitCard,
    #[serde(rename = "paypal")]
    PayPal,
    #[serde(rename = "bank_transfer")]
    BankTransfer,
}

impl PaymentMethodType {
    pub const ALL: [PaymentMethodType; 4] = [
        PaymentMethodType::CreditCard,
        PaymentMethodType::DebitCard,
        PaymentMethodType::PayPal,
        PaymentMethodType::BankTransfer,
    ];

    /// Returns true for card-backed methods.
    pub fn is_card(&self) -> bool {
        matches!(
            self,
            PaymentMethodType::CreditCard | PaymentMethodType::DebitCard
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodType::CreditCard => "credit_card",
            PaymentMethodType::DebitCard => "debit_card",
            PaymentMethodType::PayPal => "paypal",
            PaymentMethodType::BankTransfer => "bank_transfer",
        }
    }
}

impl std::fmt::Display for PaymentMethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentMethodType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethodType::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| ParseError::new("PaymentMethodType", s))
    }
}

/// Raw card data supplied with a payment request.
///
/// Card data is validated and then dropped; it is never persisted.
#[derive(Clone, Deserialize)]
pub struct CardDetails {
    pub number: String,
    pub exp_month: u32,
    pub exp_year: u32,
    pub cvv: String,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digits: String = self.number.chars().filter(char::is_ascii_digit).collect();
        let last4 = &digits[digits.len().saturating_sub(4)..];
        f.debug_struct("CardDetails")
            .field("number", &format_args!("****{last4}"))
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("cvv", &"***")
            .finish()
    }
}

/// A request from the Order Service to charge an order.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_method_id: PaymentMethodId,
    pub method_type: PaymentMethodType,
    /// Amount in minor currency units (e.g. cents).
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub card: Option<CardDetails>,
}

/// Details recorded alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusChange {
    pub reason: String,
    pub context: serde_json::Value,
    pub gateway_id: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub error_code: Option<String>,
}

impl StatusChange {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            context: serde_json::Value::Null,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    pub fn with_receipt(mut self, receipt_id: impl Into<String>) -> Self {
        self.gateway_transaction_id = Some(receipt_id.into());
        self
    }

    pub fn with_failure(
        mut self,
        failure_reason: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Self {
        self.failure_reason = Some(failure_reason.into());
        self.error_code = Some(error_code.into());
        self
    }
}

/// A payment transaction: the financial audit record for one charge attempt
/// series against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_method_id: PaymentMethodId,
    pub method_type: PaymentMethodType,
    /// Amount in minor currency units. Always positive.
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub status: PaymentStatus,
    pub gateway_id: Option<String>,
    /// Receipt id returned by the gateway on success.
    pub gateway_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub error_code: Option<String>,
    /// Number of processing passes started.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    /// Creates a new `Pending` transaction from a validated request.
    pub fn new(request: &PaymentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: PaymentId::new(),
            order_id: request.order_id,
            user_id: request.user_id,
            payment_method_id: request.payment_method_id,
            method_type: request.method_type,
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            status: PaymentStatus::Pending,
            gateway_id: None,
            gateway_transaction_id: None,
            failure_reason: None,
            error_code: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Computes the result of moving this transaction to `target`.
    ///
    /// Returns the updated transaction and the history row describing the
    /// change. `self` is not modified; the caller commits both values as one
    /// unit and only then adopts the new state.
    pub fn transition(
        &self,
        target: PaymentStatus,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<(PaymentTransaction, PaymentStatusHistory), TransitionError> {
        if !self.status.can_transition_to(target) {
            return Err(TransitionError::InvalidTransition {
                payment_id: self.id,
                from: self.status,
                to: target,
            });
        }

        let mut next = self.clone();
        next.status = target;
        next.updated_at = now;

        match target {
            PaymentStatus::Processing => {
                next.attempt_count += 1;
                next.failure_reason = None;
                next.error_code = None;
            }
            PaymentStatus::Completed => {
                next.gateway_id = change.gateway_id.clone().or(next.gateway_id);
                next.gateway_transaction_id = change.gateway_transaction_id.clone();
                next.processed_at = Some(now);
            }
            PaymentStatus::Failed => {
                next.gateway_id = change.gateway_id.clone().or(next.gateway_id);
                next.failure_reason = change.failure_reason.clone();
                next.error_code = change.error_code.clone();
                next.processed_at = Some(now);
            }
            PaymentStatus::Cancelled | PaymentStatus::Refunded | PaymentStatus::Pending => {}
        }

        let history = PaymentStatusHistory::new(
            self.id,
            self.status,
            target,
            change.reason,
            change.context,
            now,
        );

        Ok((next, history))
    }
}
