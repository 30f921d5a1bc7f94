//! Application configuration loaded from environment variables.

use std::time::Duration;

use common::ConfigError;
use common::config::{env_opt, env_or};
use domain::ValidationLimits;
use processing::GatewaySimulatorConfig;
use webhooks::WebhookConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::invalid(
                "LOG_FORMAT",
                format!("{other:?} is not one of text, json"),
            )),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL URL; in-memory storage when unset
/// - `PAYMENT_WORKERS`: payment worker tasks (default: `4`)
/// - `PAYMENT_MIN_AMOUNT`, `PAYMENT_MAX_AMOUNT`: accepted amount range in minor units
/// - `GATEWAY_SUCCESS_PROBABILITY`, `GATEWAY_MIN_LATENCY_MS`,
///   `GATEWAY_MAX_LATENCY_MS`, `GATEWAY_RNG_SEED`: simulator behavior
/// - `WEBHOOK_ENDPOINTS`: comma-separated receiver URLs
/// - `WEBHOOK_TIMEOUT_MS`, `WEBHOOK_MAX_ATTEMPTS`, `WEBHOOK_POOL_SIZE`,
///   `WEBHOOK_BATCH_SIZE`, `WEBHOOK_SWEEP_INTERVAL_SECS`: delivery tuning
/// - `WEBHOOK_CLAIM_LEASE_MS`: how long a claimed event stays hidden from other
///   sweeps (default: 60s, or twice the timeout when that is longer)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub payment_workers: usize,
    pub validation: ValidationLimits,
    pub gateway: GatewaySimulatorConfig,
    pub webhook: WebhookConfig,
}

impl Config {
    pub const DEFAULT_PAYMENT_WORKERS: usize = 4;

    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Every sub-configuration is validated here; the result is never
    /// re-read or mutated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let validation = ValidationLimits::new(
            env_or("PAYMENT_MIN_AMOUNT", ValidationLimits::DEFAULT_MIN_AMOUNT)?,
            env_or("PAYMENT_MAX_AMOUNT", ValidationLimits::DEFAULT_MAX_AMOUNT)?,
        )?;

        let gateway_defaults = GatewaySimulatorConfig::default();
        let mut gateway = GatewaySimulatorConfig::builder()
            .success_probability(env_or(
                "GATEWAY_SUCCESS_PROBABILITY",
                gateway_defaults.success_probability(),
            )?)
            .latency(
                millis_or("GATEWAY_MIN_LATENCY_MS", gateway_defaults.min_latency())?,
                millis_or("GATEWAY_MAX_LATENCY_MS", gateway_defaults.max_latency())?,
            );
        if let Some(seed) = env_opt("GATEWAY_RNG_SEED")? {
            gateway = gateway.rng_seed(seed);
        }

        let endpoints: String = env_or("WEBHOOK_ENDPOINTS", String::new())?;
        let mut webhook = WebhookConfig::builder()
            .endpoints(parse_list(&endpoints))
            .request_timeout(millis_or(
                "WEBHOOK_TIMEOUT_MS",
                WebhookConfig::DEFAULT_TIMEOUT,
            )?)
            .max_attempts(env_or(
                "WEBHOOK_MAX_ATTEMPTS",
                WebhookConfig::DEFAULT_MAX_ATTEMPTS,
            )?)
            .pool_size(env_or("WEBHOOK_POOL_SIZE", WebhookConfig::DEFAULT_POOL_SIZE)?)
            .batch_size(env_or(
                "WEBHOOK_BATCH_SIZE",
                WebhookConfig::DEFAULT_BATCH_SIZE,
            )?)
            .sweep_interval(Duration::from_secs(env_or(
                "WEBHOOK_SWEEP_INTERVAL_SECS",
                WebhookConfig::DEFAULT_SWEEP_INTERVAL.as_secs(),
            )?));
        if let Some(lease_ms) = env_opt::<u64>("WEBHOOK_CLAIM_LEASE_MS")? {
            webhook = webhook.claim_lease(Duration::from_millis(lease_ms));
        }
        let webhook = webhook.build()?;

        let payment_workers = env_or("PAYMENT_WORKERS", Self::DEFAULT_PAYMENT_WORKERS)?;
        if payment_workers == 0 {
            return Err(ConfigError::invalid("PAYMENT_WORKERS", "must be at least 1"));
        }

        Ok(Self {
            host: env_or("HOST", "0.0.0.0".to_string())?,
            port: env_or("PORT", 3000)?,
            log_level: env_or("RUST_LOG", "info".to_string())?,
            log_format: env_or("LOG_FORMAT", LogFormat::Text)?,
            database_url: env_opt("DATABASE_URL")?,
            payment_workers,
            validation,
            gateway: gateway.build()?,
            webhook,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            payment_workers: Self::DEFAULT_PAYMENT_WORKERS,
            validation: ValidationLimits::default(),
            gateway: GatewaySimulatorConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

fn millis_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_or(var, default_ms).map(Duration::from_millis)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert!(config.webhook.endpoints().is_empty());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_endpoint_list_parsing() {
        assert_eq!(
            parse_list(" http://a.local/h, ,http://b.local/h "),
            vec!["http://a.local/h", "http://b.local/h"]
        );
        assert!(parse_list("").is_empty());
    }
}
