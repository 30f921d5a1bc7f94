//! Payment processing: the gateway simulator, the state machine driver and
//! the background worker pool.

pub mod error;
pub mod gateway;
pub mod processor;
pub mod worker;

pub use error::{ProcessingError, Result};
pub use gateway::{
    FailureClass, GatewayOutcome, GatewayProfile, GatewaySimulator, GatewaySimulatorConfig,
    GatewaySimulatorConfigBuilder, PaymentGateway,
};
pub use processor::{DUPLICATE_ORDER_PAYMENT, PROCESSING_INTERRUPTED, PaymentProcessor};
pub use worker::{DEFAULT_QUEUE_CAPACITY, PaymentWorkerPool};
