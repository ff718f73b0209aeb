//! Run report: reduced metrics, abandoned steps and degraded conditions.
//!
//! Rendered as colored pass/fail text for the operator and saved as JSON
//! next to the per-unit data files.

use crate::analysis::reduction::{Metric, ReductionMetrics, Verdict};
use crate::calibration::board::BoardCheck;
use crate::calibration::orchestrator::TestFamily;
use crate::error::CalResult;
use crate::sensor::UnitUnderTest;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// A sub-sequence that stopped early. The rest of the run continued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedStep {
    pub step: String,
    pub axis: usize,
    pub cycle: usize,
    pub temp_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub part_no: String,
    pub family: TestFamily,
    pub station: String,
    pub started: DateTime<Local>,
    pub finished: Option<DateTime<Local>>,
    pub units: Vec<UnitUnderTest>,
    pub metrics: Vec<ReductionMetrics>,
    pub abandoned: Vec<AbandonedStep>,
    /// Instrument operations that finished degraded (stage not settled,
    /// chamber not converged).
    pub degraded: Vec<String>,
    /// Points where no data arrived after every acquisition attempt.
    pub skipped_points: usize,
    pub board_check: Option<BoardCheck>,
}

impl RunReport {
    pub fn new(
        part_no: impl Into<String>,
        family: TestFamily,
        station: impl Into<String>,
        units: Vec<UnitUnderTest>,
    ) -> Self {
        Self {
            part_no: part_no.into(),
            family,
            station: station.into(),
            started: Local::now(),
            finished: None,
            units,
            metrics: Vec::new(),
            abandoned: Vec::new(),
            degraded: Vec::new(),
            skipped_points: 0,
            board_check: None,
        }
    }

    /// Every metric within limits, every metric computed, nothing abandoned.
    pub fn passed(&self) -> bool {
        self.metrics.iter().all(|m| m.passed() && m.faults.is_empty())
            && self.abandoned.is_empty()
            && self.board_check.as_ref().map_or(true, BoardCheck::passed)
    }

    /// Metrics for the unit with `serial_no`.
    pub fn metrics_for<'a>(&'a self, serial_no: &'a str) -> impl Iterator<Item = &'a ReductionMetrics> + 'a {
        self.metrics.iter().filter(move |m| m.serial_no == serial_no)
    }

    pub fn finish(&mut self) {
        self.finished = Some(Local::now());
    }

    pub fn to_json(&self) -> CalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes `run_<part>_<start time>.json` under `dir`.
    pub fn save(&self, dir: &Path) -> CalResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "run_{}_{}.json",
            self.part_no,
            self.started.format("%Y%m%d_%H%M%S")
        ));
        std::fs::write(&path, self.to_json()?)?;
        info!("Run report saved to '{}'", path.display());
        Ok(path)
    }

    /// Operator-facing summary. `color` wraps verdicts in ANSI colors.
    pub fn render(&self, color: bool) -> String {
        let paint = |text: &str, code: &str| {
            if color {
                format!("{}{}{}", code, text, RESET)
            } else {
                text.to_string()
            }
        };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Part {} ({}) on {}, started {}",
            self.part_no,
            self.family,
            self.station,
            self.started.format("%Y-%m-%d %H:%M:%S")
        );
        for m in &self.metrics {
            let temp = m.temp_index.map(|t| format!(" temp {}", t)).unwrap_or_default();
            let _ = writeln!(
                out,
                "\n{} {} axis {} cycle {}{}",
                m.port, m.serial_no, m.axis, m.cycle, temp
            );
            for metric in &m.metrics {
                let _ = writeln!(out, "  {}", metric_line(metric, &paint));
            }
            for fault in &m.faults {
                let _ = writeln!(out, "  {}", paint(&format!("NOT COMPUTED  {}", fault), YELLOW));
            }
        }
        if let Some(board) = &self.board_check {
            let _ = writeln!(out, "\nBoard check");
            for check in &board.checks {
                let verdict = if check.passed {
                    paint("PASS", GREEN)
                } else {
                    paint("FAIL", RED)
                };
                let _ = writeln!(
                    out,
                    "  {:<36} {:>14.6}  {:<24} {}",
                    check.name,
                    check.measured,
                    check.limit.to_string(),
                    verdict
                );
            }
        }
        if !self.abandoned.is_empty() {
            let _ = writeln!(out, "\nAbandoned steps");
            for step in &self.abandoned {
                let _ = writeln!(
                    out,
                    "  {}",
                    paint(
                        &format!(
                            "{} (axis {}, cycle {}, temp {}): {}",
                            step.step, step.axis, step.cycle, step.temp_index, step.reason
                        ),
                        YELLOW
                    )
                );
            }
        }
        if !self.degraded.is_empty() || self.skipped_points > 0 {
            let _ = writeln!(out, "\nWarnings");
            for reason in &self.degraded {
                let _ = writeln!(out, "  {}", paint(reason, YELLOW));
            }
            if self.skipped_points > 0 {
                let _ = writeln!(
                    out,
                    "  {}",
                    paint(&format!("{} point(s) skipped for lack of data", self.skipped_points), YELLOW)
                );
            }
        }
        let verdict = if self.passed() {
            paint("PASS", GREEN)
        } else {
            paint("FAIL", RED)
        };
        let _ = writeln!(out, "\nResult: {}", verdict);
        out
    }
}

fn metric_line(metric: &Metric, paint: &dyn Fn(&str, &str) -> String) -> String {
    let limit = metric.limit.map(|l| l.to_string()).unwrap_or_default();
    let verdict = match metric.verdict {
        Verdict::Pass => paint("PASS", GREEN),
        Verdict::Fail => paint("FAIL", RED),
        Verdict::NotChecked => String::new(),
    };
    format!(
        "{:<36} {:>14.6}  {:<24} {}",
        metric.kind.label(),
        metric.value,
        limit,
        verdict
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::reduction::MetricKind;
    use crate::analysis::tolerance::Limit;
    use crate::sensor::Port;

    fn report() -> RunReport {
        let unit = UnitUnderTest::new("SN1", "ACC-1", Port(1));
        let mut report = RunReport::new("ACC-1", TestFamily::Analog, "STAND-1", vec![unit.clone()]);
        let mut metrics = ReductionMetrics::new(&unit, 0, 0, Some(0));
        metrics.push(Metric::checked(
            MetricKind::ScaleFactor,
            2.01,
            Some(Limit::Range { low: 1.5, high: 2.5 }),
        ));
        report.metrics.push(metrics);
        report
    }

    #[test]
    fn test_render_plain_and_colored() {
        let report = report();
        assert!(report.passed());
        let plain = report.render(false);
        assert!(plain.contains("Scale factor"));
        assert!(plain.contains("Result: PASS"));
        assert!(!plain.contains('\x1b'));
        let colored = report.render(true);
        assert!(colored.contains("\x1b[32mPASS\x1b[0m"));
    }

    #[test]
    fn test_abandoned_step_fails_run() {
        let mut report = report();
        report.abandoned.push(AbandonedStep {
            step: "Linearity".into(),
            axis: 0,
            cycle: 0,
            temp_index: 0,
            reason: "scan buffer short".into(),
        });
        assert!(!report.passed());
        assert!(report.render(false).contains("Abandoned steps"));
    }

    #[test]
    fn test_json_round_trip_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = report();
        report.finish();
        let path = report.save(dir.path()).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["part_no"], "ACC-1");
        assert_eq!(value["family"], "analog");
        assert_eq!(value["metrics"][0]["metrics"][0]["verdict"], "pass");
        assert_eq!(report.metrics_for("SN1").count(), 1);
    }
}
