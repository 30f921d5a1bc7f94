//! Input validation for payment requests.
//!
//! Every check is a pure function of its inputs. Violations are collected
//! rather than short-circuited so a caller can report all of them at once.

use chrono::{Datelike, NaiveDate, Utc};
use common::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::payment::{CardDetails, PaymentMethodType, PaymentRequest};

/// Currencies the engine accepts.
pub const SUPPORTED_CURRENCIES: [&str; 6] = ["USD", "EUR", "GBP", "CAD", "AUD", "JPY"];

/// Longest accepted description, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub code: &'static str,
    pub message: String,
}

/// Every violation found while validating one input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Error)]
#[error("Validation failed: {}", summary(.violations))]
pub struct ValidationErrors {
    violations: Vec<FieldViolation>,
}

fn summary(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.field, v.code))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        field: impl Into<String>,
        code: &'static str,
        message: impl Into<String>,
    ) {
        self.violations.push(FieldViolation {
            field: field.into(),
            code,
            message: message.into(),
        });
    }

    /// Appends the violations carried by `result`, if any.
    pub fn merge(&mut self, result: Result<(), ValidationErrors>) {
        if let Err(other) = result {
            self.violations.extend(other.violations);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Returns true if some violation carries `code`.
    pub fn has_code(&self, code: &str) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    fn single(field: &str, code: &'static str, message: impl Into<String>) -> Result<(), Self> {
        let mut errors = Self::new();
        errors.push(field, code, message);
        Err(errors)
    }
}

/// Accepted amount range in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    min_amount: i64,
    max_amount: i64,
}

impl ValidationLimits {
    pub const DEFAULT_MIN_AMOUNT: i64 = 1;
    pub const DEFAULT_MAX_AMOUNT: i64 = 99_999_999;

    pub fn new(min_amount: i64, max_amount: i64) -> Result<Self, ConfigError> {
        if min_amount < 1 {
            return Err(ConfigError::invalid(
                "validation.min_amount",
                "must be at least 1",
            ));
        }
        if max_amount < min_amount {
            return Err(ConfigError::invalid(
                "validation.max_amount",
                format!("{max_amount} is below the minimum {min_amount}"),
            ));
        }
        Ok(Self {
            min_amount,
            max_amount,
        })
    }

    pub fn min_amount(&self) -> i64 {
        self.min_amount
    }

    pub fn max_amount(&self) -> i64 {
        self.max_amount
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_amount: Self::DEFAULT_MIN_AMOUNT,
            max_amount: Self::DEFAULT_MAX_AMOUNT,
        }
    }
}

/// Unvalidated payment request as received from the Order Service.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequestInput {
    pub order_id: String,
    pub user_id: String,
    pub payment_method_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub method_type: Option<String>,
    #[serde(default)]
    pub card: Option<CardDetails>,
}

#[derive(Clone, Copy)]
enum JsonKind {
    String,
    Integer,
    Month,
    Object,
}

impl JsonKind {
    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Integer => value.as_i64().is_some(),
            JsonKind::Month => value.as_u64().is_some_and(|n| u32::try_from(n).is_ok()),
            JsonKind::Object => value.is_object(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            JsonKind::String => "a string",
            JsonKind::Integer => "an integer",
            JsonKind::Month => "a non-negative integer",
            JsonKind::Object => "an object",
        }
    }
}

const REQUEST_FIELDS: [(&str, JsonKind, bool); 8] = [
    ("order_id", JsonKind::String, true),
    ("user_id", JsonKind::String, true),
    ("payment_method_id", JsonKind::String, true),
    ("amount", JsonKind::Integer, true),
    ("currency", JsonKind::String, true),
    ("description", JsonKind::String, false),
    ("method_type", JsonKind::String, false),
    ("card", JsonKind::Object, false),
];

const CARD_FIELDS: [(&str, JsonKind, bool); 4] = [
    ("number", JsonKind::String, true),
    ("exp_month", JsonKind::Month, true),
    ("exp_year", JsonKind::Month, true),
    ("cvv", JsonKind::String, true),
];

fn check_shape(
    object: &serde_json::Map<String, serde_json::Value>,
    prefix: &str,
    fields: &[(&str, JsonKind, bool)],
    errors: &mut ValidationErrors,
) {
    for &(name, kind, required) in fields {
        let field = format!("{prefix}{name}");
        match object.get(name) {
            None | Some(serde_json::Value::Null) if required => {
                errors.push(field, "missing_field", format!("{name} is required"));
            }
            None | Some(serde_json::Value::Null) => {}
            Some(value) if !kind.accepts(value) => {
                errors.push(
                    field,
                    "invalid_type",
                    format!("{name} must be {}", kind.describe()),
                );
            }
            Some(_) => {}
        }
    }
}

impl PaymentRequestInput {
    /// Decodes a JSON request body.
    ///
    /// Every missing or mistyped field is reported, not only the first.
    pub fn from_json(body: &serde_json::Value) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let Some(object) = body.as_object() else {
            errors.push("body", "invalid_body", "request body must be a JSON object");
            return Err(errors);
        };

        check_shape(object, "", &REQUEST_FIELDS, &mut errors);
        if let Some(card) = object.get("card").and_then(serde_json::Value::as_object) {
            check_shape(card, "card.", &CARD_FIELDS, &mut errors);
        }
        errors.into_result()?;

        Self::deserialize(body).map_err(|e| {
            let mut errors = ValidationErrors::new();
            errors.push("body", "invalid_body", e.to_string());
            errors
        })
    }
}

/// Stateless validator configured with amount limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    limits: ValidationLimits,
}

impl Validator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ValidationLimits {
        self.limits
    }

    pub fn validate_amount(&self, amount: i64) -> Result<(), ValidationErrors> {
        if amount < self.limits.min_amount {
            return ValidationErrors::single(
                "amount",
                "min_amount",
                format!("amount must be at least {}", self.limits.min_amount),
            );
        }
        if amount > self.limits.max_amount {
            return ValidationErrors::single(
                "amount",
                "max_amount",
                format!("amount must be at most {}", self.limits.max_amount),
            );
        }
        Ok(())
    }

    pub fn validate_currency(&self, currency: &str) -> Result<(), ValidationErrors> {
        if SUPPORTED_CURRENCIES.contains(&currency) {
            Ok(())
        } else {
            ValidationErrors::single(
                "currency",
                "unsupported_currency",
                format!("currency {currency:?} is not supported"),
            )
        }
    }

    pub fn validate_card(
        &self,
        number: &str,
        exp_month: u32,
        exp_year: u32,
        cvv: &str,
    ) -> Result<(), ValidationErrors> {
        self.validate_card_at(number, exp_month, exp_year, cvv, Utc::now().date_naive())
    }

    /// Same as [`Validator::validate_card`] with an explicit current date.
    pub fn validate_card_at(
        &self,
        number: &str,
        exp_month: u32,
        exp_year: u32,
        cvv: &str,
        today: NaiveDate,
    ) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let digits: String = number
            .chars()
            .filter(|c| !matches!(c, ' ' | '-'))
            .collect();
        let well_formed =
            (13..=19).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
        if !well_formed {
            errors.push(
                "card.number",
                "invalid_card_number",
                "card number must be 13 to 19 digits",
            );
        } else if !luhn_valid(&digits) {
            errors.push(
                "card.number",
                "luhn_mismatch",
                "card number failed the checksum",
            );
        }

        if !(1..=12).contains(&exp_month) {
            errors.push(
                "card.exp_month",
                "invalid_expiry",
                "expiry month must be between 1 and 12",
            );
        } else if card_expired(exp_month, exp_year, today) {
            errors.push("card.exp_year", "card_expired", "card has expired");
        }

        let cvv_ok = (3..=4).contains(&cvv.len()) && cvv.chars().all(|c| c.is_ascii_digit());
        if !cvv_ok {
            errors.push("card.cvv", "invalid_cvv", "cvv must be 3 or 4 digits");
        }

        errors.into_result()
    }

    pub fn validate_uuid(&self, field: &str, value: &str) -> Result<(), ValidationErrors> {
        match Uuid::parse_str(value) {
            Ok(_) => Ok(()),
            Err(_) => {
                ValidationErrors::single(field, "invalid_uuid", format!("{field} must be a UUID"))
            }
        }
    }

    pub fn validate_description(&self, description: &str) -> Result<(), ValidationErrors> {
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return ValidationErrors::single(
                "description",
                "too_long",
                format!("description must be at most {MAX_DESCRIPTION_CHARS} characters"),
            );
        }
        Ok(())
    }

    /// Validates a full request and converts it into a typed [`PaymentRequest`].
    pub fn validate_payment_request(
        &self,
        input: &PaymentRequestInput,
    ) -> Result<PaymentRequest, ValidationErrors> {
        self.validate_payment_request_at(input, Utc::now().date_naive())
    }

    pub fn validate_payment_request_at(
        &self,
        input: &PaymentRequestInput,
        today: NaiveDate,
    ) -> Result<PaymentRequest, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        errors.merge(self.validate_uuid("order_id", &input.order_id));
        errors.merge(self.validate_uuid("user_id", &input.user_id));
        errors.merge(self.validate_uuid("payment_method_id", &input.payment_method_id));
        errors.merge(self.validate_amount(input.amount));
        errors.merge(self.validate_currency(&input.currency));
        if let Some(description) = &input.description {
            errors.merge(self.validate_description(description));
        }

        let method_type = match input.method_type.as_deref() {
            None => PaymentMethodType::default(),
            Some(raw) => match raw.parse::<PaymentMethodType>() {
                Ok(method) => method,
                Err(_) => {
                    errors.push(
                        "method_type",
                        "unsupported_method",
                        format!("payment method {raw:?} is not supported"),
                    );
                    PaymentMethodType::default()
                }
            },
        };

        if let Some(card) = &input.card {
            errors.merge(self.validate_card_at(
                &card.number,
                card.exp_month,
                card.exp_year,
                &card.cvv,
                today,
            ));
        }

        errors.into_result()?;

        let (Ok(order_id), Ok(user_id), Ok(payment_method_id)) = (
            input.order_id.parse(),
            input.user_id.parse(),
            input.payment_method_id.parse(),
        ) else {
            // ids were checked above
            return Err(ValidationErrors::new());
        };

        Ok(PaymentRequest {
            order_id,
            user_id,
            payment_method_id,
            method_type,
            amount: input.amount,
            currency: input.currency.clone(),
            description: input.description.clone(),
            card: input.card.clone(),
        })
    }
}

/// Luhn checksum over a string of ASCII digits.
pub fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    !digits.is_empty() && sum % 10 == 0
}

/// A card is valid through the last day of its expiry month.
fn card_expired(exp_month: u32, exp_year: u32, today: NaiveDate) -> bool {
    let year = i32::try_from(exp_year).unwrap_or(i32::MAX);
    (year, exp_month) < (today.year(), today.month())
}
