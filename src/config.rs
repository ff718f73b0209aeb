//! Station configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`StationConfig::default`])
//! 2. A TOML file (`config/station.toml` unless a path is given)
//! 3. Environment variables prefixed with `MEMSCAL_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! MEMSCAL_APPLICATION__LOG_LEVEL=debug
//! MEMSCAL_STAGE__REVERSE_POLARITY=true
//! MEMSCAL_DAQ__DATA_ATTEMPTS=8
//! ```
//!
//! The configuration is built once at startup and handed to the station by
//! reference; nothing reads it through globals.

use crate::analysis::conversion;
use crate::error::{CalError, CalResult};
use crate::error_recovery::RetryPolicy;
use crate::instrument::ChannelRange;
use crate::sensor::Port;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level station configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub application: ApplicationConfig,
    pub site: SiteConfig,
    pub stage: StageConfig,
    pub daq: DaqConfig,
    pub chamber: ChamberConfig,
    pub supply: SupplyConfig,
    pub operator: OperatorConfig,
    pub connection: ConnectionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory receiving per-unit data files and run reports
    pub data_dir: PathBuf,
    /// Directory of `<part_no>.toml` sensor specs
    pub spec_dir: PathBuf,
    /// Written into the `stage` column of every record
    pub station_name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "MEMS calibration station".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            spec_dir: PathBuf::from("config/specs"),
            station_name: "STAND-1".to_string(),
        }
    }
}

/// Test-site location, for local gravity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Geodetic latitude, degrees
    pub latitude: f64,
    /// Height above the geoid, metres
    pub height_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude: 42.936_581_002_753_77,
            height_m: 170.0,
        }
    }
}

impl SiteConfig {
    pub fn local_gravity(&self) -> f64 {
        conversion::local_gravity(self.latitude, self.height_m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageVendor {
    Ensemble,
    Simulated,
}

/// Rotary stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub vendor: StageVendor,
    /// `host:port` of the controller
    pub address: String,
    pub axis: String,
    /// Settled when `|position - target| < accuracy_deg`
    pub accuracy_deg: f64,
    pub timeout_s: f64,
    pub poll_interval_ms: u64,
    /// Degrees per second
    pub speed: f64,
    /// Stage wired backwards: every commanded and read angle is negated
    pub reverse_polarity: bool,
    /// Position samples averaged per read
    pub points_to_read: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            vendor: StageVendor::Simulated,
            address: "127.0.0.1:8000".to_string(),
            axis: "X".to_string(),
            accuracy_deg: 0.01,
            timeout_s: 60.0,
            poll_interval_ms: 500,
            speed: 25.0,
            reverse_polarity: false,
            points_to_read: 10,
        }
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaqVendor {
    Keithley,
    Simulated,
}

/// Physical channels carrying one port's X, Y and temperature signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChannels {
    pub x: String,
    pub y: String,
    pub t: String,
}

/// Differential wiring: `PORT_n` on channels `101 + 3(n-1) ..= 103 + 3(n-1)`.
pub fn default_port_map() -> BTreeMap<Port, PortChannels> {
    (1..=6u32)
        .map(|n| {
            let base = 100 + 3 * (n - 1);
            (
                Port(n as u8),
                PortChannels {
                    x: (base + 1).to_string(),
                    y: (base + 2).to_string(),
                    t: (base + 3).to_string(),
                },
            )
        })
        .collect()
}

/// NTC thermistor transducer for the plate and pillar channels.
///
/// When set, thermometry reads resistance and converts with the B equation
/// instead of asking the scanner for a thermocouple temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermistorConfig {
    /// Resistance at `t0_c`
    pub r0_ohms: f64,
    pub t0_c: f64,
    pub beta: f64,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        Self {
            r0_ohms: 10_000.0,
            t0_c: 25.0,
            beta: 3950.0,
        }
    }
}

/// Data acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub vendor: DaqVendor,
    pub address: String,
    /// Bound on polling for a non-empty sensor read
    pub timeout_s: f64,
    pub poll_interval_ms: u64,
    /// Acquisition attempts per calibration point
    pub data_attempts: u32,
    pub inter_channel_delay_s: f64,
    /// Settle time per scan cycle, voltage function
    pub voltage_secs_per_cycle: f64,
    /// Settle time per scan cycle, resistance function
    pub resistance_secs_per_cycle: f64,
    pub port_map: BTreeMap<Port, PortChannels>,
    pub plate_channels: Vec<u32>,
    pub pillar_channels: Vec<u32>,
    /// Thermistor transducer; thermocouples when absent
    pub thermistor: Option<ThermistorConfig>,
    /// Channels used by the board power-rail check
    pub board_voltage_channels: ChannelRange,
    pub board_resistance_channels: ChannelRange,
    pub board_scan_cycles: u32,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            vendor: DaqVendor::Simulated,
            address: "127.0.0.1:5025".to_string(),
            timeout_s: 10.0,
            poll_interval_ms: 200,
            data_attempts: 5,
            inter_channel_delay_s: 0.1,
            voltage_secs_per_cycle: 1.0,
            resistance_secs_per_cycle: 1.6,
            port_map: default_port_map(),
            plate_channels: vec![119],
            pillar_channels: vec![120],
            thermistor: None,
            board_voltage_channels: ChannelRange { start: 101, end: 108 },
            board_resistance_channels: ChannelRange { start: 109, end: 120 },
            board_scan_cycles: 5,
        }
    }
}

impl DaqConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inter_channel_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_channel_delay_s.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChamberVendor {
    WatlowF4t,
    Simulated,
}

/// Environmental chamber configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChamberConfig {
    pub available: bool,
    pub vendor: ChamberVendor,
    pub address: String,
    pub control_loop: u8,
    pub poll_interval_s: f64,
    /// Bound on a ramp before it is reported as degraded
    pub ramp_timeout_min: f64,
    /// Progress log cadence of blocking countdowns
    pub countdown_tick_ms: u64,
}

impl Default for ChamberConfig {
    fn default() -> Self {
        Self {
            available: false,
            vendor: ChamberVendor::Simulated,
            address: "127.0.0.1:5025".to_string(),
            control_loop: 1,
            poll_interval_s: 30.0,
            ramp_timeout_min: 120.0,
            countdown_tick_ms: 60_000,
        }
    }
}

impl ChamberConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s.max(0.0))
    }

    pub fn ramp_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ramp_timeout_min.max(0.0) * 60.0)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyVendor {
    None,
    Scpi,
    Simulated,
}

/// One supply rail and its acceptance window on the board check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailConfig {
    pub channel: u8,
    /// Board-check channel label measuring this rail
    pub label: String,
    pub volts: f64,
    pub current_limit: f64,
    pub tolerance: f64,
}

/// Power supply configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyConfig {
    pub vendor: SupplyVendor,
    pub address: String,
    pub rails: Vec<RailConfig>,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            vendor: SupplyVendor::Simulated,
            address: "127.0.0.1:5025".to_string(),
            rails: vec![
                RailConfig {
                    channel: 1,
                    label: "PWR+".to_string(),
                    volts: 15.0,
                    current_limit: 0.1,
                    tolerance: 0.25,
                },
                RailConfig {
                    channel: 2,
                    label: "PWR-".to_string(),
                    volts: -15.0,
                    current_limit: 0.1,
                    tolerance: 0.25,
                },
            ],
        }
    }
}

/// Operator interaction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Minutes without interaction before the station is flagged
    pub inactivity_minutes: f64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            inactivity_minutes: 30.0,
        }
    }
}

/// Connection-open retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
            io_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            backoff_delay: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl StationConfig {
    /// Load from `config/station.toml` and the environment.
    pub fn load() -> CalResult<Self> {
        Self::load_from("config/station.toml")
    }

    /// Load from a specific file path, then validate.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MEMSCAL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot drive a station.
    pub fn validate(&self) -> CalResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(CalError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if !(self.stage.accuracy_deg > 0.0) {
            return Err(CalError::Configuration(
                "stage.accuracy_deg must be positive".into(),
            ));
        }
        if !(self.stage.timeout_s > 0.0) || !(self.daq.timeout_s > 0.0) {
            return Err(CalError::Configuration(
                "stage and daq timeouts must be positive".into(),
            ));
        }
        if self.daq.data_attempts == 0 || self.connection.attempts == 0 {
            return Err(CalError::Configuration(
                "daq.data_attempts and connection.attempts must be at least 1".into(),
            ));
        }
        if self.daq.port_map.is_empty() {
            return Err(CalError::Configuration("daq.port_map is empty".into()));
        }
        let volts = ChannelRange::new(
            self.daq.board_voltage_channels.start,
            self.daq.board_voltage_channels.end,
        )?;
        let ohms = ChannelRange::new(
            self.daq.board_resistance_channels.start,
            self.daq.board_resistance_channels.end,
        )?;
        if volts.overlaps(&ohms) {
            return Err(CalError::Configuration(format!(
                "board voltage channels {} overlap resistance channels {}",
                volts, ohms
            )));
        }
        if self.daq.plate_channels.is_empty() || self.daq.pillar_channels.is_empty() {
            return Err(CalError::Configuration(
                "plate and pillar thermocouple channels are required".into(),
            ));
        }
        if let Some(t) = &self.daq.thermistor {
            if !(t.r0_ohms > 0.0) || !(t.beta > 0.0) {
                return Err(CalError::Configuration(
                    "daq.thermistor r0_ohms and beta must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = StationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.daq.data_attempts, 5);
        assert_eq!(config.connection.attempts, 3);
        assert_eq!(config.daq.port_map[&Port(3)].x, "107");
        assert_eq!(config.daq.port_map[&Port(6)].t, "118");
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_level = "debug"

            [stage]
            reverse_polarity = true
            accuracy_deg = 0.005

            [daq.port_map.PORT_1]
            x = "201"
            y = "202"
            t = "203"
            "#
        )
        .unwrap();
        let config = StationConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert!(config.stage.reverse_polarity);
        assert_eq!(config.stage.accuracy_deg, 0.005);
        assert_eq!(config.daq.port_map[&Port(1)].x, "201");
        assert_eq!(config.stage.speed, 25.0);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("MEMSCAL_DAQ__DATA_ATTEMPTS", "8");
        let config = StationConfig::load_from("does/not/exist.toml");
        std::env::remove_var("MEMSCAL_DAQ__DATA_ATTEMPTS");
        assert_eq!(config.unwrap().daq.data_attempts, 8);
    }

    #[test]
    fn test_overlapping_board_channels_rejected() {
        let mut config = StationConfig::default();
        config.daq.board_resistance_channels = ChannelRange { start: 105, end: 120 };
        assert!(matches!(
            config.validate(),
            Err(CalError::Configuration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_thermistor_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [daq.thermistor]
            beta = 3435.0
            "#
        )
        .unwrap();
        let config = StationConfig::load_from(file.path()).unwrap();
        let thermistor = config.daq.thermistor.unwrap();
        assert_eq!(thermistor.beta, 3435.0);
        assert_eq!(thermistor.r0_ohms, 10_000.0);
        assert!(StationConfig::default().daq.thermistor.is_none());

        let mut bad = config;
        bad.daq.thermistor = Some(ThermistorConfig {
            beta: 0.0,
            ..ThermistorConfig::default()
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StationConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }
}
