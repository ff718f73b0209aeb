//! Tolerance checks shared by the reductions, power-rail checks and
//! resistor-ratio checks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed-interval check: `target - tol <= measurement <= target + tol`.
pub fn measurement_within_tol(measurement: f64, target: f64, tol: f64) -> bool {
    measurement <= target + tol && measurement >= target - tol
}

/// A limit a measured value is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Limit {
    /// `target ± tol`, inclusive.
    Symmetric { target: f64, tol: f64 },
    /// `low ..= high`.
    Range { low: f64, high: f64 },
    /// `|value| <= max`.
    MaxAbs { max: f64 },
}

impl Limit {
    pub fn contains(&self, value: f64) -> bool {
        match *self {
            Limit::Symmetric { target, tol } => measurement_within_tol(value, target, tol),
            Limit::Range { low, high } => value >= low && value <= high,
            Limit::MaxAbs { max } => value.abs() <= max,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Symmetric { target, tol } => write!(f, "{} ± {}", target, tol),
            Limit::Range { low, high } => write!(f, "[{}, {}]", low, high),
            Limit::MaxAbs { max } => write!(f, "|x| ≤ {}", max),
        }
    }
}

/// One named comparison of a measurement against its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub name: String,
    pub measured: f64,
    pub limit: Limit,
    pub passed: bool,
}

impl LimitCheck {
    pub fn evaluate(name: impl Into<String>, measured: f64, limit: Limit) -> Self {
        Self {
            name: name.into(),
            measured,
            limit,
            passed: limit.contains(measured),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_is_inclusive() {
        let (target, tol) = (5.0, 0.25);
        assert!(measurement_within_tol(target + tol, target, tol));
        assert!(measurement_within_tol(target - tol, target, tol));
        assert!(!measurement_within_tol(target + tol + 1e-9, target, tol));
        assert!(!measurement_within_tol(target - tol - 1e-9, target, tol));
    }

    #[test]
    fn test_limit_kinds() {
        assert!(Limit::Range { low: 1.0, high: 2.0 }.contains(2.0));
        assert!(!Limit::Range { low: 1.0, high: 2.0 }.contains(2.1));
        assert!(Limit::MaxAbs { max: 0.5 }.contains(-0.5));
        assert!(!Limit::MaxAbs { max: 0.5 }.contains(-0.51));
    }

    #[test]
    fn test_limit_check_records_verdict() {
        let check = LimitCheck::evaluate("PWR+", 15.2, Limit::Symmetric { target: 15.0, tol: 0.1 });
        assert!(!check.passed);
        assert_eq!(check.name, "PWR+");
    }
}
