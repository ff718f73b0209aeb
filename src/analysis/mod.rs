//! Numerical reductions: statistics, least squares, physical conversions,
//! tolerance checks and the calibration metrics built on them.

pub mod conversion;
pub mod linear_algebra;
pub mod reduction;
pub mod statistics;
pub mod tolerance;
