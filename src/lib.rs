//! Calibration measurement and reduction engine for MEMS inertial sensors.
//!
//! The library drives a tilt-stage calibration station (rotary stage,
//! multi-channel scanner, environmental chamber, power supply), records one
//! CSV data file per unit under test and reduces the records into
//! calibration metrics checked against per-part tolerance limits.
//!
//! - [`config`]: station configuration (TOML plus `MEMSCAL_` environment)
//! - [`sensor`]: part specifications and units under test
//! - [`instrument`]: capability traits, vendor drivers and the simulator
//! - [`acquisition`], [`motion`], [`thermal`]: instrument sequencers
//! - [`calibration`]: run orchestration, data files and the run report
//! - [`analysis`]: statistics, least squares and metric reduction

pub mod acquisition;
pub mod adapters;
pub mod analysis;
pub mod calibration;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod motion;
pub mod sensor;
pub mod thermal;
