//! Per-unit append-only calibration data files.
//!
//! One CSV file per unit, named from its part and serial number. Every
//! [`CalibrationLog::append`] opens the file, writes one row and closes it
//! again, so no handle is held between samples.
use crate::calibration::record::CalibrationPoint;
use crate::error::CalResult;
use crate::sensor::UnitUnderTest;
use std::path::{Path, PathBuf};

/// Column order of the data files.
pub const HEADER: [&str; 12] = [
    "datetime",
    "stage",
    "test",
    "axis_index",
    "cycle_index",
    "temp_index",
    "angle",
    "x_output",
    "y_output",
    "z_output",
    "unit_temp",
    "plate_temp",
];

/// `part_no_<part>_serialno_<serial>.csv`
pub fn data_file_name(part_no: &str, serial_no: &str) -> String {
    format!("part_no_{}_serialno_{}.csv", part_no, serial_no)
}

/// Serial number encoded in a data file name, if it follows
/// [`data_file_name`].
pub fn serial_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let (_, serial) = stem.rsplit_once("_serialno_")?;
    (!serial.is_empty()).then(|| serial.to_string())
}

// ============================================================================
// CSV log
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::OpenOptions;
    use tracing::{debug, info};

    #[derive(Debug, Clone)]
    pub struct CalibrationLog {
        path: PathBuf,
    }

    impl CalibrationLog {
        /// Log for `unit` under `data_dir`, creating the directory if needed.
        /// An existing file is kept and appended to.
        pub fn open(data_dir: &Path, unit: &UnitUnderTest) -> CalResult<Self> {
            std::fs::create_dir_all(data_dir)?;
            let path = data_dir.join(data_file_name(&unit.part_no, &unit.serial_no));
            info!("Logging {} to '{}'", unit.serial_no, path.display());
            Ok(Self { path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Appends one record, writing the header first if the file is new.
        pub fn append(&self, point: &CalibrationPoint) -> CalResult<()> {
            let is_new = std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(is_new)
                .from_writer(file);
            writer.serialize(point)?;
            writer.flush()?;
            debug!(
                "{} axis {} cycle {} temp {} @ {:.4} deg",
                point.test, point.axis_index, point.cycle_index, point.temp_index, point.angle
            );
            Ok(())
        }

        /// All records in file order.
        pub fn read_all(&self) -> CalResult<Vec<CalibrationPoint>> {
            read_records(&self.path)
        }
    }

    /// Reads a data file written by [`CalibrationLog`].
    pub fn read_records(path: &Path) -> CalResult<Vec<CalibrationPoint>> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::CalError;

    #[derive(Debug, Clone)]
    pub struct CalibrationLog {
        path: PathBuf,
    }

    impl CalibrationLog {
        pub fn open(_data_dir: &Path, _unit: &UnitUnderTest) -> CalResult<Self> {
            Err(CalError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn append(&self, _point: &CalibrationPoint) -> CalResult<()> {
            Err(CalError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn read_all(&self) -> CalResult<Vec<CalibrationPoint>> {
            Err(CalError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    pub fn read_records(_path: &Path) -> CalResult<Vec<CalibrationPoint>> {
        Err(CalError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_records, CalibrationLog};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_records, CalibrationLog};

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::calibration::record::{SensorSample, TestName};
    use crate::sensor::Port;

    #[test]
    fn test_serial_from_file_name() {
        let name = data_file_name("ACC-1", "SN_0042");
        assert_eq!(serial_from_file_name(Path::new(&name)).as_deref(), Some("SN_0042"));
        assert_eq!(serial_from_file_name(Path::new("/data/notes.csv")), None);
    }

    fn sample(x: f64) -> SensorSample {
        SensorSample {
            x,
            y: -0.5,
            z: 0.0,
            unit_temp: 25.123,
            plate_temp: 24.9,
        }
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let unit = UnitUnderTest::new("SN-7", "ACC-1", Port(2));
        let log = CalibrationLog::open(dir.path(), &unit).unwrap();
        assert!(log.path().ends_with("part_no_ACC-1_serialno_SN-7.csv"));

        log.append(&CalibrationPoint::new("STAND-1", TestName::ZTransverse, 1, 0, 2, 0.0, sample(0.25)))
            .unwrap();
        log.append(&CalibrationPoint::new("STAND-1", TestName::Linearity, 1, 0, 2, 30.0, sample(0.5)))
            .unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.join(","));
        assert!(lines[1].contains(",STAND-1,Z-Transverse Axis Misalignment,1,0,2,0.0,0.25,"));
    }

    #[test]
    fn test_reopen_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let unit = UnitUnderTest::new("SN-8", "ACC-1", Port(1));
        let first = CalibrationLog::open(dir.path(), &unit).unwrap();
        first
            .append(&CalibrationPoint::new("STAND-1", TestName::Linearity, 0, 0, 0, -90.0, sample(-2.0)))
            .unwrap();
        let second = CalibrationLog::open(dir.path(), &unit).unwrap();
        second
            .append(&CalibrationPoint::new("STAND-1", TestName::Linearity, 0, 0, 0, 90.0, sample(2.0)))
            .unwrap();

        let records = second.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].test, TestName::Linearity);
        assert_eq!(records[0].x_output, -2.0);
        assert_eq!(records[1].angle, 90.0);
        assert_eq!(records[1].unit_temp, 25.123);
    }
}
