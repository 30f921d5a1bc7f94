//! Configuration primitives shared by every crate.
//!
//! Configuration values are built once at startup and validated on
//! construction; nothing reads the environment after that point.

use std::str::FromStr;

use thiserror::Error;

/// Errors raised while building or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value was present but outside its allowed range or shape.
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed.
    #[error("Cannot parse {var}={value:?}")]
    Parse { var: &'static str, value: String },
}

impl ConfigError {
    /// Creates an `Invalid` error for a field.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Reads an environment variable and parses it, falling back to `default`
/// when the variable is unset.
pub fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse { var, value }),
        Err(_) => Ok(default),
    }
}

/// Reads an optional environment variable and parses it when present.
pub fn env_opt<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_uses_default() {
        let value: u32 = env_or("COMMON_TEST_SURELY_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
        let opt: Option<u32> = env_opt("COMMON_TEST_SURELY_UNSET_VAR").unwrap();
        assert!(opt.is_none());
    }

    #[test]
    fn invalid_error_formats_field() {
        let err = ConfigError::invalid("webhook.max_attempts", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for webhook.max_attempts: must be at least 1"
        );
    }
}
