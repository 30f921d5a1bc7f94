//! API server entry point.

use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use repository::{InMemoryPaymentRepository, PaymentRepository, PostgresPaymentRepository};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use webhooks::HttpWebhookTransport;

/// Payments left `PENDING` by a previous run that are re-queued at start-up.
const RESUME_LIMIT: usize = 10_000;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the server and background workers on `repo` until shutdown.
async fn serve<R>(config: Config, repo: R, metrics_handle: PrometheusHandle)
where
    R: PaymentRepository + Clone + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services =
        api::create_default_state(&config, repo, HttpWebhookTransport::new(), shutdown_rx.clone());

    if let Err(e) = services.workers.resume_pending(RESUME_LIMIT).await {
        tracing::error!(error = %e, "failed to resume pending payments");
    }
    let sweeper = services.sweeper.spawn(shutdown_rx);

    let app = api::create_app(services.state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, workers = config.payment_workers, "starting payment API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop background work once the listener has drained.
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("background workers already stopped");
    }
    services.workers.join().await;
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "webhook sweeper panicked");
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::routes::metrics::describe();

    // 4. Pick storage and run
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let repo = PostgresPaymentRepository::new(pool);
            repo.run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL storage");
            serve(config, repo, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            serve(config, InMemoryPaymentRepository::new(), metrics_handle).await;
        }
    }
}
