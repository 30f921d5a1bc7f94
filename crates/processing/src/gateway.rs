//! Payment gateway seam and the simulator behind it.
//!
//! The simulator stands in for real card networks. It picks a gateway by
//! weight among those that serve the payment method, decides the outcome
//! (deterministic amount-suffix overrides first, then the configured
//! success probability) and sleeps for a random latency before replying.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::ConfigError;
use domain::{PaymentMethodType, PaymentTransaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Why a simulated charge was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    InsufficientFunds,
    CardDeclined,
    NetworkError,
    InvalidPaymentMethod,
}

impl FailureClass {
    /// Classes drawn for probabilistic failures.
    pub const RANDOM: [FailureClass; 3] = [
        FailureClass::CardDeclined,
        FailureClass::InsufficientFunds,
        FailureClass::NetworkError,
    ];

    /// Error code stored on the failed transaction.
    pub fn error_code(&self) -> &'static str {
        match self {
            FailureClass::InsufficientFunds => "INSUFFICIENT_FUNDS",
            FailureClass::CardDeclined => "CARD_DECLINED",
            FailureClass::NetworkError => "NETWORK_ERROR",
            FailureClass::InvalidPaymentMethod => "INVALID_PAYMENT_METHOD",
        }
    }

    /// Human-readable failure reason.
    pub fn reason(&self) -> &'static str {
        match self {
            FailureClass::InsufficientFunds => "insufficient funds",
            FailureClass::CardDeclined => "card declined by issuer",
            FailureClass::NetworkError => "network error while contacting gateway",
            FailureClass::InvalidPaymentMethod => "invalid payment method",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.error_code())
    }
}

/// One simulated gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayProfile {
    pub id: String,
    /// Relative selection weight among gateways serving the same method.
    pub weight: u32,
    pub supported_methods: Vec<PaymentMethodType>,
}

impl GatewayProfile {
    pub fn new(
        id: impl Into<String>,
        weight: u32,
        supported_methods: impl IntoIterator<Item = PaymentMethodType>,
    ) -> Self {
        Self {
            id: id.into(),
            weight,
            supported_methods: supported_methods.into_iter().collect(),
        }
    }

    pub fn supports(&self, method_type: PaymentMethodType) -> bool {
        self.supported_methods.contains(&method_type)
    }
}

/// Validated simulator configuration.
#[derive(Debug, Clone)]
pub struct GatewaySimulatorConfig {
    success_probability: f64,
    min_latency: Duration,
    max_latency: Duration,
    gateways: Vec<GatewayProfile>,
    overrides: BTreeMap<u8, FailureClass>,
    rng_seed: Option<u64>,
}

impl GatewaySimulatorConfig {
    pub const DEFAULT_SUCCESS_PROBABILITY: f64 = 0.9;
    pub const DEFAULT_MIN_LATENCY: Duration = Duration::from_millis(50);
    pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(250);

    pub fn builder() -> GatewaySimulatorConfigBuilder {
        GatewaySimulatorConfigBuilder::default()
    }

    /// Outcomes forced by the last two decimal digits of the amount.
    pub fn default_overrides() -> BTreeMap<u8, FailureClass> {
        BTreeMap::from([
            (1, FailureClass::InsufficientFunds),
            (2, FailureClass::CardDeclined),
            (3, FailureClass::NetworkError),
            (4, FailureClass::InvalidPaymentMethod),
        ])
    }

    pub fn default_gateways() -> Vec<GatewayProfile> {
        vec![
            GatewayProfile::new(
                "stripe_sim",
                70,
                [
                    PaymentMethodType::CreditCard,
                    PaymentMethodType::DebitCard,
                    PaymentMethodType::BankTransfer,
                ],
            ),
            GatewayProfile::new(
                "adyen_sim",
                30,
                [PaymentMethodType::CreditCard, PaymentMethodType::DebitCard],
            ),
            GatewayProfile::new("paypal_sim", 100, [PaymentMethodType::PayPal]),
        ]
    }

    pub fn success_probability(&self) -> f64 {
        self.success_probability
    }

    pub fn min_latency(&self) -> Duration {
        self.min_latency
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn gateways(&self) -> &[GatewayProfile] {
        &self.gateways
    }

    /// Returns the forced failure for `amount`, if any.
    pub fn override_for(&self, amount: i64) -> Option<FailureClass> {
        let suffix = u8::try_from(amount.rem_euclid(100)).ok()?;
        self.overrides.get(&suffix).copied()
    }

    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl Default for GatewaySimulatorConfig {
    fn default() -> Self {
        Self {
            success_probability: Self::DEFAULT_SUCCESS_PROBABILITY,
            min_latency: Self::DEFAULT_MIN_LATENCY,
            max_latency: Self::DEFAULT_MAX_LATENCY,
            gateways: Self::default_gateways(),
            overrides: Self::default_overrides(),
            rng_seed: None,
        }
    }
}

/// Builder for [`GatewaySimulatorConfig`].
#[derive(Debug, Clone, Default)]
pub struct GatewaySimulatorConfigBuilder {
    config: GatewaySimulatorConfig,
}

impl GatewaySimulatorConfigBuilder {
    pub fn success_probability(mut self, probability: f64) -> Self {
        self.config.success_probability = probability;
        self
    }

    pub fn latency(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_latency = min;
        self.config.max_latency = max;
        self
    }

    /// Disables latency injection.
    pub fn no_latency(self) -> Self {
        self.latency(Duration::ZERO, Duration::ZERO)
    }

    pub fn gateways(mut self, gateways: Vec<GatewayProfile>) -> Self {
        self.config.gateways = gateways;
        self
    }

    /// Forces `class` for every amount ending in `suffix`.
    pub fn override_suffix(mut self, suffix: u8, class: FailureClass) -> Self {
        self.config.overrides.insert(suffix, class);
        self
    }

    pub fn clear_overrides(mut self) -> Self {
        self.config.overrides.clear();
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<GatewaySimulatorConfig, ConfigError> {
        let config = self.config;

        if !(0.0..=1.0).contains(&config.success_probability) {
            return Err(ConfigError::invalid(
                "gateway.success_probability",
                format!("{} is outside [0, 1]", config.success_probability),
            ));
        }
        if config.min_latency > config.max_latency {
            return Err(ConfigError::invalid(
                "gateway.latency",
                format!(
                    "minimum {:?} exceeds maximum {:?}",
                    config.min_latency, config.max_latency
                ),
            ));
        }
        for (i, gateway) in config.gateways.iter().enumerate() {
            if gateway.weight == 0 {
                return Err(ConfigError::invalid(
                    "gateway.gateways",
                    format!("{} has zero weight", gateway.id),
                ));
            }
            if config.gateways[..i].iter().any(|g| g.id == gateway.id) {
                return Err(ConfigError::invalid(
                    "gateway.gateways",
                    format!("duplicate gateway id {}", gateway.id),
                ));
            }
        }
        for method in PaymentMethodType::ALL {
            if !config.gateways.iter().any(|g| g.supports(method)) {
                return Err(ConfigError::invalid(
                    "gateway.gateways",
                    format!("no gateway supports {method}"),
                ));
            }
        }
        if let Some(suffix) = config.overrides.keys().find(|s| **s >= 100) {
            return Err(ConfigError::invalid(
                "gateway.overrides",
                format!("suffix {suffix} has more than two digits"),
            ));
        }

        Ok(config)
    }
}

/// Result of one charge attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayOutcome {
    pub success: bool,
    pub gateway_id: String,
    pub receipt_id: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub error_code: Option<String>,
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

mod latency_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Trait for charging a payment.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Attempts to authorize `payment`. Declines are outcomes, not errors.
    async fn charge(&self, payment: &PaymentTransaction) -> GatewayOutcome;
}

/// Randomized gateway with injectable success rate, latency and overrides.
///
/// With a fixed `rng_seed` the sequence of decisions is reproducible.
#[derive(Debug, Clone)]
pub struct GatewaySimulator {
    config: Arc<GatewaySimulatorConfig>,
    rng: Arc<Mutex<StdRng>>,
}

/// Everything decided up front so that no lock is held while sleeping.
struct Decision {
    gateway_id: String,
    failure: Option<FailureClass>,
    latency: Duration,
}

impl GatewaySimulator {
    pub fn new(config: GatewaySimulatorConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config: Arc::new(config),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn config(&self) -> &GatewaySimulatorConfig {
        &self.config
    }

    fn decide(&self, amount: i64, method_type: PaymentMethodType) -> Decision {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let candidates: Vec<&GatewayProfile> = self
            .config
            .gateways
            .iter()
            .filter(|g| g.supports(method_type))
            .collect();
        let total: u64 = candidates.iter().map(|g| u64::from(g.weight)).sum();
        let gateway_id = if total == 0 {
            "unavailable".to_string()
        } else {
            let mut pick = rng.gen_range(0..total);
            candidates
                .iter()
                .find(|g| {
                    let weight = u64::from(g.weight);
                    if pick < weight {
                        true
                    } else {
                        pick -= weight;
                        false
                    }
                })
                .map(|g| g.id.clone())
                .unwrap_or_default()
        };

        let failure = match self.config.override_for(amount) {
            Some(class) => Some(class),
            None if total == 0 => Some(FailureClass::InvalidPaymentMethod),
            None if rng.gen_bool(self.config.success_probability) => None,
            None => Some(FailureClass::RANDOM[rng.gen_range(0..FailureClass::RANDOM.len())]),
        };

        let (min, max) = (self.config.min_latency, self.config.max_latency);
        let latency = if min == max {
            min
        } else {
            rng.gen_range(min..=max)
        };

        Decision {
            gateway_id,
            failure,
            latency,
        }
    }

    /// Simulates authorizing `amount` with a gateway serving `method_type`.
    #[tracing::instrument(skip(self))]
    pub async fn simulate(
        &self,
        amount: i64,
        currency: &str,
        method_type: PaymentMethodType,
    ) -> GatewayOutcome {
        let decision = self.decide(amount, method_type);

        if !decision.latency.is_zero() {
            tokio::time::sleep(decision.latency).await;
        }

        let outcome = match decision.failure {
            None => GatewayOutcome {
                success: true,
                receipt_id: Some(format!(
                    "{}_txn_{}",
                    decision.gateway_id,
                    uuid::Uuid::new_v4().simple()
                )),
                gateway_id: decision.gateway_id,
                failure_class: None,
                error_code: None,
                latency: decision.latency,
            },
            Some(class) => GatewayOutcome {
                success: false,
                gateway_id: decision.gateway_id,
                receipt_id: None,
                failure_class: Some(class),
                error_code: Some(class.error_code().to_string()),
                latency: decision.latency,
            },
        };

        let result = outcome
            .failure_class
            .map_or("success", |class| class.error_code());
        metrics::counter!(
            "gateway_simulations_total",
            "gateway" => outcome.gateway_id.clone(),
            "result" => result
        )
        .increment(1);
        metrics::histogram!("gateway_latency_seconds").record(outcome.latency.as_secs_f64());
        tracing::debug!(
            gateway = %outcome.gateway_id,
            success = outcome.success,
            latency_ms = outcome.latency.as_millis() as u64,
            "gateway simulation finished"
        );

        outcome
    }
}

#[async_trait]
impl PaymentGateway for GatewaySimulator {
    async fn charge(&self, payment: &PaymentTransaction) -> GatewayOutcome {
        self.simulate(payment.amount, &payment.currency, payment.method_type)
            .await
    }
}
