//! Integration tests for the payment state machine and webhook records.

use chrono::{TimeDelta, Utc};
use common::{OrderId, PaymentMethodId, UserId};
use domain::{
    BackoffSchedule, DeliveryClaim, DeliveryStatus, PaymentMethodType, PaymentRequest,
    PaymentStatus, PaymentTransaction, StatusChange, TransitionError, WebhookEvent,
    WebhookEventType,
};
use serde_json::json;

fn request(amount: i64) -> PaymentRequest {
    PaymentRequest {
        order_id: OrderId::new(),
        user_id: UserId::new(),
        payment_method_id: PaymentMethodId::new(),
        method_type: PaymentMethodType::CreditCard,
        amount,
        currency: "USD".to_string(),
        description: None,
        card: None,
    }
}

/// Drives a fresh transaction into `status` through allowed transitions.
fn in_status(status: PaymentStatus) -> PaymentTransaction {
    let now = Utc::now();
    let tx = PaymentTransaction::new(&request(5000), now);
    let path: &[PaymentStatus] = match status {
        PaymentStatus::Pending => &[],
        PaymentStatus::Processing => &[PaymentStatus::Processing],
        PaymentStatus::Completed => &[PaymentStatus::Processing, PaymentStatus::Completed],
        PaymentStatus::Failed => &[PaymentStatus::Processing, PaymentStatus::Failed],
        PaymentStatus::Cancelled => &[PaymentStatus::Cancelled],
        PaymentStatus::Refunded => &[
            PaymentStatus::Processing,
            PaymentStatus::Completed,
            PaymentStatus::Refunded,
        ],
    };
    path.iter().fold(tx, |tx, target| {
        tx.transition(*target, StatusChange::new("setup"), now)
            .unwrap()
            .0
    })
}

mod transition_table {
    use super::*;

    #[test]
    fn every_disallowed_pair_is_rejected_without_change() {
        let allowed = [
            (PaymentStatus::Pending, PaymentStatus::Processing),
            (PaymentStatus::Pending, PaymentStatus::Cancelled),
            (PaymentStatus::Processing, PaymentStatus::Completed),
            (PaymentStatus::Processing, PaymentStatus::Failed),
            (PaymentStatus::Completed, PaymentStatus::Refunded),
            (PaymentStatus::Failed, PaymentStatus::Processing),
        ];

        for from in PaymentStatus::ALL {
            for to in PaymentStatus::ALL {
                let tx = in_status(from);
                let before = tx.clone();
                let result = tx.transition(to, StatusChange::new("table check"), Utc::now());

                if allowed.contains(&(from, to)) {
                    let (next, history) = result.unwrap();
                    assert_eq!(next.status, to);
                    assert_eq!(history.previous_status, from);
                } else {
                    assert_eq!(
                        result.unwrap_err(),
                        TransitionError::InvalidTransition {
                            payment_id: tx.id,
                            from,
                            to
                        }
                    );
                    assert_eq!(tx, before);
                }
            }
        }
    }

    #[test]
    fn failure_details_survive_until_retry() {
        let now = Utc::now();
        let tx = in_status(PaymentStatus::Processing);
        let (failed, history) = tx
            .transition(
                PaymentStatus::Failed,
                StatusChange::new("gateway declined")
                    .with_gateway("stripe_sim")
                    .with_failure("Insufficient funds", "INSUFFICIENT_FUNDS")
                    .with_context(json!({"latency_ms": 120})),
                now,
            )
            .unwrap();

        assert_eq!(failed.failure_reason.as_deref(), Some("Insufficient funds"));
        assert_eq!(failed.gateway_id.as_deref(), Some("stripe_sim"));
        assert_eq!(history.context["latency_ms"], 120);
        assert!(failed.gateway_transaction_id.is_none());
    }
}

mod webhook_delivery {
    use super::*;

    fn event(max_attempts: u32) -> WebhookEvent {
        let tx = in_status(PaymentStatus::Completed);
        WebhookEvent::new(
            tx.id,
            WebhookEventType::PaymentCompleted,
            json!({"payment_id": tx.id}),
            "http://orders.local/hooks",
            max_attempts,
            Utc::now(),
        )
    }

    #[test]
    fn five_server_errors_exhaust_the_event() {
        let backoff = BackoffSchedule::default();
        let mut ev = event(5);
        let mut now = Utc::now();

        while ev.delivery_status == DeliveryStatus::Pending {
            assert!(ev.is_claimable(now));
            ev.claim(DeliveryClaim::new(now + TimeDelta::seconds(30)), now);
            ev.record_failure(Some(500), "HTTP 500", &backoff, now)
                .unwrap();
            if let Some(next) = ev.next_retry_at {
                now = next;
            }
        }

        assert_eq!(ev.attempts, 5);
        assert_eq!(ev.attempts, ev.max_attempts);
        assert_eq!(ev.delivery_status, DeliveryStatus::Failed);
        assert!(ev.next_retry_at.is_none());
        assert_eq!(ev.last_status_code, Some(500));
    }

    #[test]
    fn first_retry_waits_one_minute() {
        let backoff = BackoffSchedule::default();
        let mut ev = event(5);
        let now = Utc::now();
        ev.record_failure(None, "connection refused", &backoff, now)
            .unwrap();

        assert_eq!(ev.next_retry_at, Some(now + TimeDelta::seconds(60)));
        assert!(!ev.is_due(now + TimeDelta::seconds(59)));
        assert!(ev.is_due(now + TimeDelta::seconds(60)));
        assert_eq!(ev.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn single_attempt_budget_fails_immediately() {
        let mut ev = event(1);
        ev.record_failure(Some(503), "HTTP 503", &BackoffSchedule::default(), Utc::now())
            .unwrap();
        assert_eq!(ev.delivery_status, DeliveryStatus::Failed);
        assert!(ev.next_retry_at.is_none());
    }
}
