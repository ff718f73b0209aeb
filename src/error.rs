//! Custom error types for the calibration engine.
//!
//! `CalError` is the single error type used across the library. It separates
//! the fault classes that the station treats differently:
//!
//! - **Transport faults** (`Transport`, `Timeout`): an instrument could not be
//!   reached. Retried at connection-open, fatal once retries are exhausted.
//! - **Malformed scan data** (`MalformedScan`): a buffer with the wrong number
//!   of values or a non-numeric token. The sample is discarded and re-acquired.
//! - **Numerical faults** (`InsufficientData`, `SingularMatrix`): fatal to the
//!   metric being computed, never to the run.
//! - **Configuration faults** (`Config`, `Configuration`, `SpecNotFound`).
//!
//! Tolerance failures are not errors. They are reported through
//! [`crate::analysis::reduction::Verdict`].
//!
//! Recoverable instrument conditions (stage did not settle, scan came back
//! empty, chamber did not converge) are carried by [`Outcome::Degraded`]
//! instead of an error, so callers can keep going with the best value read.

use thiserror::Error;

/// Convenience alias for results using the calibration error type.
pub type CalResult<T> = std::result::Result<T, CalError>;

#[derive(Error, Debug)]
pub enum CalError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error on '{device}': {message}")]
    Transport { device: String, message: String },

    #[error("Timed out waiting for '{0}'")]
    Timeout(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Malformed scan data: {0}")]
    MalformedScan(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Singular matrix (|det| = {det:e})")]
    SingularMatrix { det: f64 },

    #[error("No sensor spec found for part number '{0}'")]
    SpecNotFound(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for CalError {
    fn from(err: figment::Error) -> Self {
        CalError::Config(Box::new(err))
    }
}

impl CalError {
    /// Builds a transport fault for `device`.
    pub fn transport(device: impl Into<String>, message: impl ToString) -> Self {
        CalError::Transport {
            device: device.into(),
            message: message.to_string(),
        }
    }

    /// True for faults that mean the instrument itself is unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, CalError::Transport { .. } | CalError::Timeout(_))
    }
}

/// Result of an instrument operation that may finish in a degraded state.
///
/// Faults travel as `Err(CalError)`; `Outcome` only distinguishes a clean
/// success from a usable-but-suspect value.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Degraded { value: T, reason: String },
}

impl<T> Outcome<T> {
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Outcome::Degraded {
            value,
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Success(value) | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Success(value) | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Degraded { value, reason } => Outcome::Degraded {
                value: f(value),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CalError::Instrument("stage fault".to_string());
        assert_eq!(err.to_string(), "Instrument error: stage fault");
    }

    #[test]
    fn test_transport_classification() {
        assert!(CalError::transport("daq", "refused").is_transport());
        assert!(CalError::Timeout("stage".into()).is_transport());
        assert!(!CalError::InsufficientData("1 point".into()).is_transport());
    }

    #[test]
    fn test_outcome_map_keeps_reason() {
        let outcome = Outcome::degraded(1.5, "not settled").map(|v| v * 2.0);
        assert!(outcome.is_degraded());
        assert_eq!(*outcome.value(), 3.0);
        match outcome {
            Outcome::Degraded { reason, .. } => assert_eq!(reason, "not settled"),
            Outcome::Success(_) => panic!("expected degraded"),
        }
    }
}
