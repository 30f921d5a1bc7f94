//! Payment transaction model and lifecycle.

mod history;
mod status;
mod transaction;

pub use history::PaymentStatusHistory;
pub use status::PaymentStatus;
pub use transaction::{
    CardDetails, PaymentMethodType, PaymentRequest, PaymentTransaction, StatusChange,
};
