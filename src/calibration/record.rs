//! The atomic measured record and the per-point sensor sample.

use crate::analysis::conversion::stage_angle_to_input;
use crate::sensor::SensorType;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which routine produced a record. Serialized with the names the data
/// files have always carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestName {
    #[serde(rename = "Linearity")]
    Linearity,
    #[serde(rename = "Y-Transverse Axis Misalignment")]
    YTransverse,
    #[serde(rename = "Z-Transverse Axis Misalignment")]
    ZTransverse,
    #[serde(rename = "Full-Scale")]
    FullScale,
    #[serde(rename = "Polarity")]
    Polarity,
    #[serde(rename = "Thermal Calibration")]
    ThermalCalibration,
    #[serde(rename = "Bandwidth")]
    Bandwidth,
    #[serde(rename = "Noise")]
    Noise,
    #[serde(rename = "Tumble")]
    Tumble,
}

impl TestName {
    pub fn as_str(self) -> &'static str {
        match self {
            TestName::Linearity => "Linearity",
            TestName::YTransverse => "Y-Transverse Axis Misalignment",
            TestName::ZTransverse => "Z-Transverse Axis Misalignment",
            TestName::FullScale => "Full-Scale",
            TestName::Polarity => "Polarity",
            TestName::ThermalCalibration => "Thermal Calibration",
            TestName::Bandwidth => "Bandwidth",
            TestName::Noise => "Noise",
            TestName::Tumble => "Tumble",
        }
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sensor's outputs at a sample point, before it is bound to a grid
/// position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub unit_temp: f64,
    pub plate_temp: f64,
}

/// One measured record. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    #[serde(rename = "datetime", with = "timestamp_format")]
    pub timestamp: DateTime<Local>,
    /// Station that produced the record.
    pub stage: String,
    pub test: TestName,
    pub axis_index: usize,
    pub cycle_index: usize,
    pub temp_index: usize,
    /// Achieved stage angle, degrees.
    pub angle: f64,
    pub x_output: f64,
    pub y_output: f64,
    pub z_output: f64,
    pub unit_temp: f64,
    pub plate_temp: f64,
}

impl CalibrationPoint {
    pub fn new(
        stage: impl Into<String>,
        test: TestName,
        axis_index: usize,
        cycle_index: usize,
        temp_index: usize,
        angle: f64,
        sample: SensorSample,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            stage: stage.into(),
            test,
            axis_index,
            cycle_index,
            temp_index,
            angle,
            x_output: sample.x,
            y_output: sample.y,
            z_output: sample.z,
            unit_temp: sample.unit_temp,
            plate_temp: sample.plate_temp,
        }
    }

    /// Output of the sensitive axis when testing `axis` (X, Y, Z columns).
    pub fn output(&self, axis: usize) -> f64 {
        match axis {
            0 => self.x_output,
            1 => self.y_output,
            _ => self.z_output,
        }
    }

    /// Output of the transverse column paired with `axis`: Y for axis 0,
    /// X otherwise.
    pub fn transverse_output(&self, axis: usize) -> f64 {
        match axis {
            0 => self.y_output,
            _ => self.x_output,
        }
    }

    /// Sensor input at this record's stage angle.
    pub fn input(&self, sensor_type: SensorType) -> f64 {
        stage_angle_to_input(self.angle, sensor_type)
    }

    /// True when the record belongs to the `(axis, cycle, temp)` bucket.
    pub fn in_bucket(&self, axis: usize, cycle: usize, temp: usize) -> bool {
        self.axis_index == axis && self.cycle_index == cycle && self.temp_index == temp
    }
}

mod timestamp_format {
    use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Local>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(text.trim(), FORMAT).map_err(de::Error::custom)?;
        match Local.from_local_datetime(&naive) {
            LocalResult::Single(time) | LocalResult::Ambiguous(time, _) => Ok(time),
            LocalResult::None => Err(de::Error::custom(format!("'{}' does not exist locally", text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(axis: usize) -> CalibrationPoint {
        CalibrationPoint::new(
            "STAND-1",
            TestName::ZTransverse,
            axis,
            0,
            1,
            180.0,
            SensorSample {
                x: 1.0,
                y: 2.0,
                z: 3.0,
                unit_temp: 25.1,
                plate_temp: 25.0,
            },
        )
    }

    #[test]
    fn test_axis_columns() {
        let p = point(0);
        assert_eq!(p.output(0), 1.0);
        assert_eq!(p.output(1), 2.0);
        assert_eq!(p.output(2), 3.0);
        assert_eq!(p.transverse_output(0), 2.0);
        assert_eq!(p.transverse_output(1), 1.0);
        assert_eq!(p.transverse_output(2), 1.0);
        assert!(p.in_bucket(0, 0, 1));
        assert!(!p.in_bucket(0, 1, 1));
    }

    #[test]
    fn test_test_names_serialize_as_labels() {
        let json = serde_json::to_string(&TestName::YTransverse).unwrap();
        assert_eq!(json, "\"Y-Transverse Axis Misalignment\"");
        assert_eq!(TestName::ThermalCalibration.to_string(), "Thermal Calibration");
    }

    #[test]
    fn test_input_conversion() {
        let mut p = point(0);
        p.angle = 30.0;
        assert!((p.input(SensorType::Accelerometer) - 0.5).abs() < 1e-12);
        assert_eq!(p.input(SensorType::Inclinometer), 30.0);
    }
}
