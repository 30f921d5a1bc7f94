//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers descriptions for every metric the engine records.
///
/// Safe to call more than once.
pub fn describe() {
    metrics::describe_counter!(
        "payments_requested_total",
        "Payment requests accepted, by method type"
    );
    metrics::describe_counter!(
        "payment_transitions_total",
        "Committed payment status changes, by from/to status"
    );
    metrics::describe_counter!(
        "gateway_simulations_total",
        "Simulated gateway charges, by gateway and result"
    );
    metrics::describe_histogram!(
        "gateway_latency_seconds",
        Unit::Seconds,
        "Injected gateway latency"
    );
    metrics::describe_counter!(
        "webhook_deliveries_total",
        "Webhook delivery attempts, by outcome"
    );
    metrics::describe_histogram!(
        "webhook_sweep_claimed",
        Unit::Count,
        "Events claimed per retry sweep"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
