//! Capability traits for the station instruments.
//!
//! Each physical role on the test stand gets one trait. Vendor drivers
//! implement the trait over a [`crate::adapters::Transport`]; the simulated
//! station implements them in memory. Which implementation backs a role is
//! decided once, in [`registry`], from the station configuration.
//!
//! | Role | Trait | Drivers |
//! |---|---|---|
//! | Multi-channel acquisition | [`ScanDevice`] | [`keithley::Daq6510`], [`sim::SimDaq`] |
//! | Plate/pillar thermometry | [`Thermometer`] | [`keithley::Daq6510`], [`sim::SimDaq`] |
//! | Rotary stage | [`MotionDevice`] | [`aerotech::EnsembleStage`], [`sim::SimStage`] |
//! | Environmental chamber | [`ThermalDevice`] | [`watlow::F4tChamber`], [`sim::SimChamber`] |
//! | Power supply | [`PowerDevice`] | [`supply::ScpiSupply`], [`sim::SimSupply`] |
//! | Digital sensor bus | [`SensorBus`] | [`sim::SimSensorBus`] |

pub mod aerotech;
pub mod keithley;
pub mod registry;
pub mod sim;
pub mod supply;
pub mod watlow;

use crate::analysis::statistics;
use crate::error::{CalError, CalResult};
use crate::sensor::Port;
use async_trait::async_trait;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Scan device
// ============================================================================

/// Measurement function selected on a channel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFunction {
    Voltage,
    Resistance,
    AcVoltage,
}

impl fmt::Display for ScanFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanFunction::Voltage => "voltage",
            ScanFunction::Resistance => "resistance",
            ScanFunction::AcVoltage => "AC voltage",
        };
        f.write_str(name)
    }
}

/// Inclusive range of physical scanner channels, e.g. `101..=108`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub start: u32,
    pub end: u32,
}

impl ChannelRange {
    pub fn new(start: u32, end: u32) -> CalResult<Self> {
        if start > end {
            return Err(CalError::Configuration(format!(
                "channel range {}:{} is reversed",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, channel: u32) -> bool {
        channel >= self.start && channel <= self.end
    }

    pub fn overlaps(&self, other: &ChannelRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(@{}:{})", self.start, self.end)
    }
}

/// Multi-channel acquisition instrument.
///
/// Instruments are stateful: a scan must be configured with
/// [`configure`](ScanDevice::configure) and [`set_scan`](ScanDevice::set_scan)
/// before [`trigger`](ScanDevice::trigger). Callers never overlap operations
/// on the same device.
#[async_trait]
pub trait ScanDevice: Send + Sync {
    /// Device identifier used in logs and errors.
    fn id(&self) -> &str;

    /// Select the measurement function over an inclusive channel range.
    ///
    /// # Errors
    /// - Transport fault
    async fn configure(&self, function: ScanFunction, channels: ChannelRange) -> CalResult<()>;

    /// Create a repeating scan of `cycles` repetitions with `delay` between
    /// channels.
    ///
    /// # Errors
    /// - Transport fault
    async fn set_scan(&self, channels: ChannelRange, delay: Duration, cycles: u32) -> CalResult<()>;

    /// Start the configured scan.
    async fn trigger(&self) -> CalResult<()>;

    /// Block the instrument command queue until the scan has finished.
    async fn wait_complete(&self) -> CalResult<()>;

    /// First and last occupied index of the reading buffer.
    async fn buffer_extent(&self) -> CalResult<(u32, u32)>;

    /// Readings `start..=end` as a comma-separated string of floats.
    ///
    /// # Errors
    /// - Transport fault
    async fn read_buffer(&self, start: u32, end: u32) -> CalResult<String>;

    /// Clear the reading buffer.
    async fn clear_buffer(&self) -> CalResult<()>;

    /// Open every relay so no channel stays connected after a scan.
    async fn open_all(&self) -> CalResult<()>;

    /// One immediate pass over the sensor channels, formatted as
    /// alternating `reading,channel` pairs.
    ///
    /// # Returns
    /// - Empty string when the instrument has nothing to report yet
    async fn read_channels(&self) -> CalResult<String>;
}

// ============================================================================
// Thermometry
// ============================================================================

/// Ambient temperatures around the units under test, °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbientTemperatures {
    pub plate: f64,
    pub pillar: f64,
}

impl AmbientTemperatures {
    /// Sentinel reported when thermometry cannot be read.
    pub const UNAVAILABLE: f64 = -999.0;

    pub fn unavailable() -> Self {
        Self {
            plate: Self::UNAVAILABLE,
            pillar: Self::UNAVAILABLE,
        }
    }

    /// Averages thermocouple readings into plate and pillar temperatures.
    pub fn from_channels(readings: &[f64], plate: &[usize], pillar: &[usize]) -> CalResult<Self> {
        let pick = |idx: &[usize]| -> CalResult<f64> {
            let values: Vec<f64> = idx
                .iter()
                .map(|&i| {
                    readings.get(i).copied().ok_or_else(|| {
                        CalError::MalformedScan(format!(
                            "thermometry channel {} missing from {} readings",
                            i,
                            readings.len()
                        ))
                    })
                })
                .collect::<CalResult<_>>()?;
            statistics::mean(&values)
                .ok_or_else(|| CalError::Configuration("empty thermocouple group".into()))
        };
        Ok(Self {
            plate: pick(plate)?,
            pillar: pick(pillar)?,
        })
    }
}

#[async_trait]
pub trait Thermometer: Send + Sync {
    fn id(&self) -> &str;

    /// Read the plate and pillar temperatures.
    async fn read_temperatures(&self) -> CalResult<AmbientTemperatures>;
}

// ============================================================================
// Motion device
// ============================================================================

/// Position as reported by a stage controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionReading {
    Single(f64),
    /// Some controllers return a burst of samples to be averaged.
    Samples(Vec<f64>),
}

impl PositionReading {
    /// Position in degrees; the mean for sampled readings.
    pub fn value(&self) -> Option<f64> {
        match self {
            PositionReading::Single(v) => Some(*v),
            PositionReading::Samples(samples) => statistics::mean(samples),
        }
    }

    /// Standard error of the sampled position, when known.
    pub fn uncertainty(&self) -> Option<f64> {
        match self {
            PositionReading::Single(_) => None,
            PositionReading::Samples(samples) => statistics::standard_error(samples),
        }
    }
}

/// Rotary stage controller.
#[async_trait]
pub trait MotionDevice: Send + Sync {
    fn id(&self) -> &str;

    /// Start an absolute move.
    ///
    /// # Arguments
    /// * `angle` - Target in controller degrees
    /// * `speed` - Degrees per second
    ///
    /// # Behavior
    /// - Returns once the command is accepted; does not wait for arrival
    ///
    /// # Errors
    /// - Transport fault
    async fn move_absolute(&self, angle: f64, speed: f64) -> CalResult<()>;

    /// Start a move relative to the current position.
    async fn move_incremental(&self, delta: f64, speed: f64) -> CalResult<()>;

    /// Current position, possibly as a burst of samples.
    async fn read_position(&self) -> CalResult<PositionReading>;

    /// Run the controller's homing routine. The resulting position is not
    /// guaranteed to be exactly zero.
    async fn home(&self) -> CalResult<()>;
}

// ============================================================================
// Thermal device
// ============================================================================

/// Environmental chamber controller.
#[async_trait]
pub trait ThermalDevice: Send + Sync {
    fn id(&self) -> &str;

    async fn set_setpoint(&self, temp: f64) -> CalResult<()>;

    async fn read_setpoint(&self) -> CalResult<f64>;

    /// Chamber air temperature as measured by the controller.
    async fn read_process_value(&self) -> CalResult<f64>;
}

// ============================================================================
// Power device
// ============================================================================

/// Multi-channel bench supply.
#[async_trait]
pub trait PowerDevice: Send + Sync {
    fn id(&self) -> &str;

    /// Program `channel` to `volts` with a current limit of `amps`.
    async fn apply(&self, channel: u8, volts: f64, amps: f64) -> CalResult<()>;

    async fn set_output(&self, channel: u8, enabled: bool) -> CalResult<()>;
}

// ============================================================================
// Digital sensor bus
// ============================================================================

/// One reading from a digital sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigitalReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub temperature: f64,
}

/// Tumble calibration coefficients written into a digital sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TumbleCoefficients {
    pub orthonormal: Matrix3<f64>,
    pub offset: Vector3<f64>,
}

/// Serial link to the digital units under test.
#[async_trait]
pub trait SensorBus: Send + Sync {
    fn id(&self) -> &str;

    /// Put the sensor on `port` into calibration mode. Tumble mode also resets
    /// the orthonormal matrix to identity and erases the lookup table.
    async fn configure(&self, port: Port, tumble: bool) -> CalResult<()>;

    async fn read_outputs(&self, port: Port) -> CalResult<DigitalReading>;

    /// Load the lookup table built from the unit's calibration data file.
    async fn load_lookup_table(&self, port: Port, data_file: &Path) -> CalResult<()>;

    async fn load_tumble_coefficients(
        &self,
        port: Port,
        coefficients: &TumbleCoefficients,
    ) -> CalResult<()>;
}

/// Parses the first float in an instrument reply, tolerating unit suffixes
/// and stray punctuation such as `%25.000` or `+2.1E+01C`.
pub(crate) fn parse_reply_float(device: &str, reply: &str) -> CalResult<f64> {
    let cleaned: String = reply
        .trim()
        .trim_start_matches('%')
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        .collect();
    cleaned.parse::<f64>().map_err(|_| {
        CalError::Instrument(format!("{}: cannot parse '{}' as a number", device, reply.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_range_display_and_overlap() {
        let volts = ChannelRange::new(101, 108).unwrap();
        let ohms = ChannelRange::new(109, 120).unwrap();
        assert_eq!(volts.to_string(), "(@101:108)");
        assert_eq!(volts.len(), 8);
        assert_eq!(ohms.len(), 12);
        assert!(!volts.overlaps(&ohms));
        assert!(volts.overlaps(&ChannelRange::new(108, 110).unwrap()));
        assert!(ChannelRange::new(5, 1).is_err());
    }

    #[test]
    fn test_position_reading_average() {
        let reading = PositionReading::Samples(vec![1.0, 1.2, 0.8, 1.0]);
        assert!((reading.value().unwrap() - 1.0).abs() < 1e-12);
        assert!(reading.uncertainty().unwrap() > 0.0);
        assert_eq!(PositionReading::Single(3.0).value(), Some(3.0));
        assert_eq!(PositionReading::Samples(vec![]).value(), None);
    }

    #[test]
    fn test_ambient_from_channels() {
        let readings = [20.0, 22.0, 24.0, 30.0, 31.0, 32.0];
        let ambient = AmbientTemperatures::from_channels(&readings, &[0, 1, 2], &[3, 4, 5]).unwrap();
        assert_eq!(ambient.plate, 22.0);
        assert_eq!(ambient.pillar, 31.0);
        assert!(AmbientTemperatures::from_channels(&readings, &[7], &[0]).is_err());
    }

    #[test]
    fn test_parse_reply_float() {
        assert_eq!(parse_reply_float("stage", "%12.5").unwrap(), 12.5);
        assert_eq!(parse_reply_float("f4t", "+2.5E+01\r\n").unwrap(), 25.0);
        assert!(parse_reply_float("f4t", "ERR").is_err());
    }
}
