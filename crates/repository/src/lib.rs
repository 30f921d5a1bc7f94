//! Persistence for payment transactions, their status history and the
//! webhook events they produce.
//!
//! Two implementations of [`PaymentRepository`] are provided: an in-memory
//! store for tests and local runs, and a PostgreSQL store.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use error::{RepositoryError, Result};
pub use memory::InMemoryPaymentRepository;
pub use postgres::PostgresPaymentRepository;
pub use query::WebhookEventQuery;
pub use store::{ClaimedWebhookEvent, PaymentRepository, PaymentRepositoryExt, TransitionRecord};
