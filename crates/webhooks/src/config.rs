//! Webhook engine configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use common::ConfigError;
use domain::{BackoffSchedule, WebhookEventType};

/// Immutable, validated configuration for the delivery engine.
///
/// Built through [`WebhookConfig::builder`]; `build` rejects inconsistent
/// values so the engine never has to re-check them.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    endpoints: Vec<String>,
    notify_on: BTreeSet<WebhookEventType>,
    request_timeout: Duration,
    max_attempts: u32,
    backoff: BackoffSchedule,
    pool_size: usize,
    batch_size: usize,
    claim_lease: Duration,
    sweep_interval: Duration,
    immediate_dispatch: bool,
}

impl WebhookConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_POOL_SIZE: usize = 8;
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

    /// Event types notified when no explicit set is configured.
    pub const DEFAULT_NOTIFY_ON: [WebhookEventType; 4] = [
        WebhookEventType::PaymentCompleted,
        WebhookEventType::PaymentFailed,
        WebhookEventType::PaymentCancelled,
        WebhookEventType::PaymentRefunded,
    ];

    /// Creates a builder populated with defaults.
    pub fn builder() -> WebhookConfigBuilder {
        WebhookConfigBuilder::default()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Returns true if events of this type are created.
    pub fn notifies(&self, event_type: WebhookEventType) -> bool {
        self.notify_on.contains(&event_type)
    }

    pub fn notify_on(&self) -> &BTreeSet<WebhookEventType> {
        &self.notify_on
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffSchedule {
        &self.backoff
    }

    /// Maximum number of attempts in flight at once.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Maximum number of events claimed per sweep.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Whether newly committed events are attempted right away when the
    /// pool has room, instead of waiting for the next sweep.
    pub fn immediate_dispatch(&self) -> bool {
        self.immediate_dispatch
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            notify_on: Self::DEFAULT_NOTIFY_ON.into_iter().collect(),
            request_timeout: Self::DEFAULT_TIMEOUT,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffSchedule::default(),
            pool_size: Self::DEFAULT_POOL_SIZE,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            claim_lease: Self::DEFAULT_CLAIM_LEASE,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            immediate_dispatch: true,
        }
    }
}

/// Builder for [`WebhookConfig`].
///
/// Without an explicit lease, `build` uses the larger of
/// [`WebhookConfig::DEFAULT_CLAIM_LEASE`] and twice the request timeout.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfigBuilder {
    config: WebhookConfig,
    claim_lease: Option<Duration>,
}

impl WebhookConfigBuilder {
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoints.push(url.into());
        self
    }

    pub fn endpoints<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn notify_on(mut self, event_types: impl IntoIterator<Item = WebhookEventType>) -> Self {
        self.config.notify_on = event_types.into_iter().collect();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = Some(lease);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn immediate_dispatch(mut self, enabled: bool) -> Self {
        self.config.immediate_dispatch = enabled;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<WebhookConfig, ConfigError> {
        let mut config = self.config;
        config.claim_lease = self.claim_lease.unwrap_or_else(|| {
            WebhookConfig::DEFAULT_CLAIM_LEASE.max(config.request_timeout.saturating_mul(2))
        });

        for url in &config.endpoints {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                ConfigError::invalid("webhook.endpoints", format!("{url:?}: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::invalid(
                    "webhook.endpoints",
                    format!("{url:?} is not an http(s) URL"),
                ));
            }
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "webhook.max_attempts",
                "must be at least 1",
            ));
        }
        if config.request_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "webhook.request_timeout",
                "must be positive",
            ));
        }
        if config.pool_size == 0 {
            return Err(ConfigError::invalid("webhook.pool_size", "must be at least 1"));
        }
        if config.batch_size == 0 {
            return Err(ConfigError::invalid("webhook.batch_size", "must be at least 1"));
        }
        if config.claim_lease <= config.request_timeout {
            return Err(ConfigError::invalid(
                "webhook.claim_lease",
                format!(
                    "{:?} must exceed the request timeout {:?}",
                    config.claim_lease, config.request_timeout
                ),
            ));
        }
        if config.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "webhook.sweep_interval",
                "must be positive",
            ));
        }

        Ok(config)
    }
}
