//! HTTP service host for the payment transaction lifecycle engine.
//!
//! Provides REST endpoints for payment requests and lifecycle operations,
//! runs the payment worker pool and webhook sweeper, and exposes structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use domain::Validator;
use metrics_exporter_prometheus::PrometheusHandle;
use processing::{
    DEFAULT_QUEUE_CAPACITY, GatewaySimulator, PaymentGateway, PaymentProcessor, PaymentWorkerPool,
};
use repository::PaymentRepository;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use webhooks::{WebhookEngine, WebhookSweeper, WebhookTransport};

use config::Config;
use routes::payments::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<R, G, T>(
    state: Arc<AppState<R, G, T>>,
    metrics_handle: PrometheusHandle,
) -> Router
where
    R: PaymentRepository + Clone + 'static,
    G: PaymentGateway + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<R, G, T>))
        .route("/payments", post(routes::payments::create::<R, G, T>))
        .route("/payments/{id}", get(routes::payments::get::<R, G, T>))
        .route(
            "/payments/{id}/history",
            get(routes::payments::history::<R, G, T>),
        )
        .route(
            "/payments/{id}/webhooks",
            get(routes::payments::webhooks::<R, G, T>),
        )
        .route(
            "/payments/{id}/cancel",
            post(routes::payments::cancel::<R, G, T>),
        )
        .route(
            "/payments/{id}/refund",
            post(routes::payments::refund::<R, G, T>),
        )
        .route(
            "/payments/{id}/retry",
            post(routes::payments::retry::<R, G, T>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Everything `create_default_state` wires together.
pub struct Services<R, T> {
    pub state: Arc<AppState<R, GatewaySimulator, T>>,
    /// Already running; feed it through `state.queue`.
    pub workers: PaymentWorkerPool<R, GatewaySimulator, T>,
    /// Not yet running; call `spawn` to start periodic retries.
    pub sweeper: WebhookSweeper<R, T>,
}

/// Creates the default application state backed by the gateway simulator.
///
/// Spawns the payment worker pool, so it must be called inside a Tokio
/// runtime.
pub fn create_default_state<R, T>(
    config: &Config,
    repo: R,
    transport: T,
    shutdown: watch::Receiver<bool>,
) -> Services<R, T>
where
    R: PaymentRepository + Clone + 'static,
    T: WebhookTransport + Clone + 'static,
{
    let engine = WebhookEngine::new(repo.clone(), transport, config.webhook.clone());
    let gateway = GatewaySimulator::new(config.gateway.clone());
    let processor = Arc::new(PaymentProcessor::new(
        repo,
        gateway,
        engine.clone(),
        Validator::new(config.validation),
    ));

    let workers = PaymentWorkerPool::spawn(
        processor.clone(),
        config.payment_workers,
        DEFAULT_QUEUE_CAPACITY,
        shutdown,
    );
    let state = Arc::new(AppState {
        processor,
        queue: workers.sender(),
    });

    Services {
        state,
        workers,
        sweeper: WebhookSweeper::new(engine),
    }
}
