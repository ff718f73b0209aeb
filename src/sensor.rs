//! Sensor specifications and the units under test.
//!
//! A [`SensorSpec`] describes one part number: what kind of sensor it is, the
//! calibration point grid, the temperature plan, the tolerance limits and which
//! checks are required. It is loaded once per run through a [`SpecSource`] and
//! never mutated afterwards.
//!
//! ## Spec file example
//!
//! ```toml
//! part_no = "ACC-2G-3"
//! sensor_type = "accelerometer"
//! output_type = "analog_voltage"
//! input_units = "g"
//! output_units = "V"
//! axes_no = 2
//! range = 2.0
//! linearity_points = 9
//! extra_points = 1
//! cal_temps = [25.0]
//! cal_temp_tol = [1.0]
//! settle_time_s = 5.0
//!
//! [limits]
//! linearity = [0.1, 0.1, 0.2]
//! bias = 0.01
//! moa = 0.5
//! mpa = 0.5
//! scale_factor = 2.0
//!
//! [tests]
//! linearity = true
//! pend_axis = true
//! ```

use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Accelerometer,
    Inclinometer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    AnalogVoltage,
    AnalogCurrent,
    Digital,
}

impl OutputType {
    pub fn is_digital(self) -> bool {
        matches!(self, OutputType::Digital)
    }
}

/// Bandwidth acceptance window, Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthLimits {
    pub low: f64,
    pub high: f64,
}

/// Tolerance limits for one part number.
///
/// Per-axis vectors fall back to their last entry when shorter than the
/// number of axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceLimits {
    /// Maximum nonlinearity per axis, % of full range.
    #[serde(default)]
    pub linearity: Vec<f64>,
    /// Maximum |bias|, input units.
    #[serde(default = "default_bias")]
    pub bias: f64,
    /// Maximum |output-axis misalignment|, degrees.
    #[serde(default = "default_misalignment")]
    pub moa: f64,
    /// Maximum |pendulous-axis misalignment|, degrees.
    #[serde(default = "default_misalignment")]
    pub mpa: f64,
    /// Maximum input-axis misalignment, degrees. Unchecked when absent.
    #[serde(default)]
    pub input_axis: Option<f64>,
    /// Nominal scale factor, output units per input unit.
    pub scale_factor: f64,
    /// Allowed fractional deviation from the nominal scale factor.
    #[serde(default = "default_sf_tol")]
    pub scale_factor_tol: f64,
    /// Nominal full-scale output. Unchecked when absent.
    #[serde(default)]
    pub fso: Option<f64>,
    /// Maximum bias temperature sensitivity per axis, ppm/°C.
    #[serde(default)]
    pub bts: Vec<f64>,
    /// Maximum accuracy error per axis, input units.
    #[serde(default)]
    pub accuracy: Vec<f64>,
    /// Maximum cross-axis output per axis, output units.
    #[serde(default)]
    pub cross_axis: Vec<f64>,
    #[serde(default)]
    pub bandwidth: Option<BandwidthLimits>,
    /// Allowed deviation of each orthonormal matrix element from identity.
    #[serde(default = "default_orthonormal_limit")]
    pub orthonormal_element: f64,
    /// Full-scale ADC counts of digital parts.
    #[serde(default = "default_nominal_adc")]
    pub nominal_adc: f64,
}

fn default_bias() -> f64 {
    0.01
}

fn default_misalignment() -> f64 {
    1.0
}

fn default_sf_tol() -> f64 {
    0.25
}

fn default_orthonormal_limit() -> f64 {
    0.03
}

fn default_nominal_adc() -> f64 {
    256_000.0
}

impl ToleranceLimits {
    /// Inclusive scale-factor window `nominal·(1 ± tol)`.
    pub fn scale_factor_bounds(&self) -> (f64, f64) {
        let a = self.scale_factor * (1.0 - self.scale_factor_tol);
        let b = self.scale_factor * (1.0 + self.scale_factor_tol);
        (a.min(b), a.max(b))
    }

    pub fn linearity_for(&self, axis: usize) -> Option<f64> {
        per_axis(&self.linearity, axis)
    }

    pub fn bts_for(&self, axis: usize) -> Option<f64> {
        per_axis(&self.bts, axis)
    }

    pub fn accuracy_for(&self, axis: usize) -> Option<f64> {
        per_axis(&self.accuracy, axis)
    }

    pub fn cross_axis_for(&self, axis: usize) -> Option<f64> {
        per_axis(&self.cross_axis, axis)
    }
}

fn per_axis(values: &[f64], axis: usize) -> Option<f64> {
    values.get(axis).or_else(|| values.last()).copied()
}

/// Which checks a part number requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestEnables {
    pub polarity: bool,
    pub bias: bool,
    pub linearity: bool,
    pub pend_axis: bool,
    pub bandwidth: bool,
    pub noise: bool,
    pub over_temp: bool,
}

/// Per-part-number configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub part_no: String,
    #[serde(default)]
    pub model_no: String,
    pub sensor_type: SensorType,
    pub output_type: OutputType,
    pub input_units: String,
    pub output_units: String,
    pub axes_no: usize,
    /// Full-scale input range (g or degrees).
    pub range: f64,
    pub linearity_points: usize,
    #[serde(default)]
    pub extra_points: usize,
    /// Number of cycles; cycle 0 calibrates, later cycles verify.
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    #[serde(default)]
    pub cal_temps: Vec<f64>,
    #[serde(default)]
    pub cal_temp_tol: Vec<f64>,
    #[serde(default)]
    pub verify_temps: Vec<f64>,
    #[serde(default)]
    pub verify_temp_tol: Vec<f64>,
    #[serde(default)]
    pub soak_time_min: f64,
    #[serde(default)]
    pub settle_time_s: f64,
    pub limits: ToleranceLimits,
    #[serde(default)]
    pub tests: TestEnables,
    #[serde(default = "default_mount")]
    pub mount: Vec<String>,
}

fn default_cycles() -> usize {
    1
}

fn default_mount() -> Vec<String> {
    vec!["X".into(), "Y".into(), "Z".into()]
}

/// One temperature index of a cycle's thermal plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureStep {
    pub index: usize,
    pub target: f64,
    pub tolerance: f64,
}

impl SensorSpec {
    /// Total calibration points: linearity points plus the extra points at
    /// both ends.
    pub fn point_count(&self) -> usize {
        self.linearity_points + 2 * self.extra_points
    }

    pub fn calibration_points(&self) -> CalResult<Vec<f64>> {
        build_calibration_array(self.range, self.point_count(), self.sensor_type)
    }

    /// Temperature plan for `cycle`: calibration temperatures for cycle 0,
    /// verification temperatures afterwards.
    pub fn temperature_plan(&self, cycle: usize) -> Vec<TemperatureStep> {
        let (temps, tols) = if cycle == 0 {
            (&self.cal_temps, &self.cal_temp_tol)
        } else {
            (&self.verify_temps, &self.verify_temp_tol)
        };
        temps
            .iter()
            .enumerate()
            .map(|(index, &target)| TemperatureStep {
                index,
                target,
                tolerance: per_axis(tols, index).unwrap_or(1.0),
            })
            .collect()
    }

    pub fn mount_label(&self, axis: usize) -> &str {
        self.mount.get(axis).map(String::as_str).unwrap_or("?")
    }

    pub fn validate(&self) -> CalResult<()> {
        if self.part_no.trim().is_empty() {
            return Err(CalError::Configuration("part_no is empty".into()));
        }
        if self.axes_no == 0 || self.axes_no > 3 {
            return Err(CalError::Configuration(format!(
                "{}: axes_no must be 1..=3, got {}",
                self.part_no, self.axes_no
            )));
        }
        if !self.output_type.is_digital() && self.axes_no > 2 {
            return Err(CalError::Configuration(format!(
                "{}: analog parts carry X and Y outputs only, got {} axes",
                self.part_no, self.axes_no
            )));
        }
        if !(self.range > 0.0) {
            return Err(CalError::Configuration(format!(
                "{}: range must be positive",
                self.part_no
            )));
        }
        if self.cycles == 0 {
            return Err(CalError::Configuration(format!(
                "{}: at least one cycle is required",
                self.part_no
            )));
        }
        if self.limits.scale_factor == 0.0 {
            return Err(CalError::Configuration(format!(
                "{}: nominal scale factor must be non-zero",
                self.part_no
            )));
        }
        self.calibration_points().map(|_| ())
    }
}

/// Builds the symmetric calibration angle grid, degrees, ascending.
///
/// Accelerometer points are `asin`-spaced so the sensor input (g) is evenly
/// spaced; ranges above 1 g are clamped to 1 g since a tilt stage cannot
/// exceed it. Inclinometer points are evenly spaced over `±range`.
///
/// # Errors
/// `Configuration` unless `points` is odd and at least 3.
pub fn build_calibration_array(
    range: f64,
    points: usize,
    sensor_type: SensorType,
) -> CalResult<Vec<f64>> {
    if points < 3 || points % 2 == 0 {
        return Err(CalError::Configuration(format!(
            "calibration point count must be odd and >= 3, got {}",
            points
        )));
    }
    let last = (points - 1) as f64;
    let array = match sensor_type {
        SensorType::Accelerometer => {
            let r = range.abs().min(1.0);
            (0..points)
                .map(|i| (-r + 2.0 * r * i as f64 / last).clamp(-1.0, 1.0).asin().to_degrees())
                .collect()
        }
        SensorType::Inclinometer => {
            let r = range.abs();
            (0..points).map(|i| -r + 2.0 * r * i as f64 / last).collect()
        }
    };
    Ok(array)
}

// ============================================================================
// Units under test
// ============================================================================

/// Logical test port a unit is plugged into (`PORT_1` … `PORT_n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port(pub u8);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PORT_{}", self.0)
    }
}

impl FromStr for Port {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("PORT_").trim_start_matches("port_");
        digits
            .parse::<u8>()
            .ok()
            .filter(|n| *n > 0)
            .map(Port)
            .ok_or_else(|| CalError::Configuration(format!("invalid port '{}'", s)))
    }
}

impl TryFrom<String> for Port {
    type Error = CalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

/// One physical sensor bound to a port for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitUnderTest {
    pub serial_no: String,
    pub part_no: String,
    pub port: Port,
}

impl UnitUnderTest {
    pub fn new(serial_no: impl Into<String>, part_no: impl Into<String>, port: Port) -> Self {
        Self {
            serial_no: serial_no.into(),
            part_no: part_no.into(),
            port,
        }
    }
}

// ============================================================================
// Spec sources
// ============================================================================

/// Read-only lookup of sensor specs by part number.
#[async_trait]
pub trait SpecSource: Send + Sync {
    /// Fetch the spec for `part_no`.
    ///
    /// # Errors
    /// - `SpecNotFound` if the part number is unknown
    /// - parse/validation errors for a malformed spec
    async fn fetch(&self, part_no: &str) -> CalResult<SensorSpec>;
}

/// Spec source backed by `<dir>/<part_no>.toml` files.
#[derive(Debug, Clone)]
pub struct TomlSpecSource {
    dir: PathBuf,
}

impl TomlSpecSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SpecSource for TomlSpecSource {
    async fn fetch(&self, part_no: &str) -> CalResult<SensorSpec> {
        let path = self.dir.join(format!("{}.toml", part_no));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CalError::SpecNotFound(part_no.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let spec: SensorSpec = toml::from_str(&text)?;
        spec.validate()?;
        info!("Loaded sensor spec '{}' from {}", part_no, path.display());
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
        part_no = "ACC-1"
        sensor_type = "accelerometer"
        output_type = "analog_voltage"
        input_units = "g"
        output_units = "V"
        axes_no = 2
        range = 2.0
        linearity_points = 9
        extra_points = 1
        cal_temps = [-40.0, 25.0, 85.0]
        cal_temp_tol = [2.0, 1.0]
        verify_temps = [25.0]
        verify_temp_tol = [0.5]

        [limits]
        linearity = [0.1, 0.2]
        scale_factor = 2.0

        [tests]
        linearity = true
    "#;

    #[test]
    fn test_accelerometer_array_is_symmetric() {
        let points = build_calibration_array(5.0, 11, SensorType::Accelerometer).unwrap();
        assert_eq!(points.len(), 11);
        assert!(points.windows(2).all(|w| w[1] > w[0]));
        assert!((points[0] + 90.0).abs() < 1e-12);
        assert!((points[10] - 90.0).abs() < 1e-12);
        assert!(points[5].abs() < 1e-12);
        for i in 0..5 {
            assert!((points[i] + points[10 - i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_inclinometer_array_is_linear() {
        let points = build_calibration_array(30.0, 5, SensorType::Inclinometer).unwrap();
        assert_eq!(points, vec![-30.0, -15.0, 0.0, 15.0, 30.0]);
    }

    #[test]
    fn test_even_point_count_rejected() {
        assert!(build_calibration_array(1.0, 4, SensorType::Accelerometer).is_err());
        assert!(build_calibration_array(1.0, 1, SensorType::Inclinometer).is_err());
    }

    #[test]
    fn test_spec_parse_and_defaults() {
        let spec: SensorSpec = toml::from_str(SPEC).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.point_count(), 11);
        assert_eq!(spec.cycles, 1);
        assert_eq!(spec.limits.scale_factor_tol, 0.25);
        assert_eq!(spec.limits.linearity_for(2), Some(0.2));
        assert_eq!(spec.limits.scale_factor_bounds(), (1.5, 2.5));
        assert_eq!(spec.mount_label(1), "Y");
    }

    #[test]
    fn test_temperature_plan_per_cycle() {
        let spec: SensorSpec = toml::from_str(SPEC).unwrap();
        let cal = spec.temperature_plan(0);
        assert_eq!(cal.len(), 3);
        assert_eq!(cal[2].tolerance, 1.0);
        let verify = spec.temperature_plan(1);
        assert_eq!(verify.len(), 1);
        assert_eq!(verify[0].tolerance, 0.5);
    }

    #[test]
    fn test_port_parsing() {
        assert_eq!("PORT_3".parse::<Port>().unwrap(), Port(3));
        assert_eq!("4".parse::<Port>().unwrap(), Port(4));
        assert!("PORT_0".parse::<Port>().is_err());
        assert_eq!(Port(2).to_string(), "PORT_2");
    }

    #[tokio::test]
    async fn test_toml_spec_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ACC-1.toml"), SPEC).unwrap();
        let source = TomlSpecSource::new(dir.path());
        let spec = source.fetch("ACC-1").await.unwrap();
        assert_eq!(spec.part_no, "ACC-1");
        assert!(matches!(
            source.fetch("NOPE").await,
            Err(CalError::SpecNotFound(_))
        ));
    }
}
