//! Calibration runs: sequencing, per-unit records, operator interaction and
//! the run report.

pub mod board;
pub mod log;
pub mod operator;
pub mod orchestrator;
pub mod record;
pub mod report;
pub mod status;

pub use orchestrator::{CalibrationOrchestrator, Station, TestFamily};
pub use report::RunReport;
