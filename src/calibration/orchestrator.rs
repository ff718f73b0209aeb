//! Calibration run sequencing.
//!
//! [`CalibrationOrchestrator`] walks the axis × cycle × temperature grid for
//! one part number and its units, moves the stage through each test's
//! angles, samples every unit after the settle time and appends one record
//! per unit per point. At the end of the run the in-memory records are
//! reduced into the [`RunReport`].
//!
//! Fault handling follows two rules:
//! - transport faults stop the run (after the supply is switched off)
//! - any other error abandons the current sub-sequence, which is noted in
//!   the report, and the run moves on

use crate::acquisition::{ChannelScanner, SenseMode};
use crate::analysis::reduction::{self, ReductionEngine, ReductionMetrics};
use crate::calibration::log::CalibrationLog;
use crate::calibration::operator::Operator;
use crate::calibration::record::{CalibrationPoint, SensorSample, TestName};
use crate::calibration::report::{AbandonedStep, RunReport};
use crate::calibration::status::{InactivityMonitor, StatusBoard};
use crate::config::StationConfig;
use crate::error::{CalError, CalResult, Outcome};
use crate::instrument::{PowerDevice, ScanFunction, SensorBus, TumbleCoefficients};
use crate::motion::MotionSequencer;
use crate::sensor::{Port, SensorSpec, TemperatureStep, TestEnables, UnitUnderTest};
use crate::thermal::{countdown, ThermalSequencer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Which sequence a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFamily {
    /// Voltage or current output read through the scanner.
    Analog,
    /// Multi-temperature sweep of digital units read over the sensor bus.
    Digital,
    /// Six-orientation misalignment and offset estimation of digital units.
    Tumble,
}

impl TestFamily {
    /// Family for previously logged data: tumble records win, then the
    /// part's output type decides.
    pub fn infer(spec: &SensorSpec, records: &[CalibrationPoint]) -> Self {
        if records.iter().any(|r| r.test == TestName::Tumble) {
            TestFamily::Tumble
        } else if spec.output_type.is_digital() {
            TestFamily::Digital
        } else {
            TestFamily::Analog
        }
    }
}

impl fmt::Display for TestFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestFamily::Analog => "analog",
            TestFamily::Digital => "digital",
            TestFamily::Tumble => "tumble",
        };
        f.write_str(name)
    }
}

impl FromStr for TestFamily {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analog" => Ok(TestFamily::Analog),
            "digital" => Ok(TestFamily::Digital),
            "tumble" => Ok(TestFamily::Tumble),
            other => Err(CalError::Configuration(format!(
                "unknown test family '{}'",
                other
            ))),
        }
    }
}

/// Analog sequence phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    PolarityCheck,
    LinearitySweep,
    FullScale,
    BiasCheck,
    MisalignmentCheck,
    BandwidthCheck,
    NoiseCheck,
    Done,
}

impl Phase {
    /// Phases repeated at every temperature step.
    pub fn is_per_temperature(self) -> bool {
        matches!(
            self,
            Phase::LinearitySweep | Phase::FullScale | Phase::BiasCheck | Phase::MisalignmentCheck
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NotStarted => "Not started",
            Phase::PolarityCheck => "Polarity",
            Phase::LinearitySweep => "Linearity",
            Phase::FullScale => "Full scale",
            Phase::BiasCheck => "Bias",
            Phase::MisalignmentCheck => "Misalignment",
            Phase::BandwidthCheck => "Bandwidth",
            Phase::NoiseCheck => "Noise",
            Phase::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Sub-phases of one temperature step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalPhase {
    Ramp,
    Soak,
    Sample,
}

impl fmt::Display for ThermalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThermalPhase::Ramp => "Ramp",
            ThermalPhase::Soak => "Soak",
            ThermalPhase::Sample => "Sample",
        };
        f.write_str(name)
    }
}

/// Analog phases enabled by the part's test switches, ending with `Done`.
///
/// The linearity sweep already contains the bias and misalignment pairs, so
/// the standalone checks only run without it. Without a sweep the scale
/// factor comes from the two full-scale points.
pub fn phase_plan(tests: &TestEnables) -> Vec<Phase> {
    let mut plan = Vec::new();
    if tests.polarity {
        plan.push(Phase::PolarityCheck);
    }
    if tests.linearity {
        plan.push(Phase::LinearitySweep);
    } else {
        plan.push(Phase::FullScale);
        if tests.bias {
            plan.push(Phase::BiasCheck);
        }
        if tests.pend_axis {
            plan.push(Phase::MisalignmentCheck);
        }
    }
    if tests.bandwidth {
        plan.push(Phase::BandwidthCheck);
    }
    if tests.noise {
        plan.push(Phase::NoiseCheck);
    }
    plan.push(Phase::Done);
    plan
}

/// The instruments a run drives.
pub struct Station {
    pub scanner: ChannelScanner,
    pub motion: MotionSequencer,
    /// `None` when the station has no chamber; runs stay at ambient.
    pub thermal: Option<ThermalSequencer>,
    pub supply: Option<Arc<dyn PowerDevice>>,
    /// Required for digital and tumble runs.
    pub bus: Option<Arc<dyn SensorBus>>,
}

/// Where in the run grid a sample is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GridPosition {
    axis: usize,
    cycle: usize,
    temp: usize,
}

/// Result of reducing one unit's records.
#[derive(Debug, Clone, Default)]
pub struct UnitReduction {
    pub metrics: Vec<ReductionMetrics>,
    /// Tumble coefficients to load into the unit, tumble runs only.
    pub tumble: Option<TumbleCoefficients>,
}

/// Reduces every bucket present in `records` for `unit`.
///
/// Analog data is reduced per `(axis, cycle, temp)`, digital data per
/// `(axis, cycle)` across temperatures, tumble data once per unit.
pub fn reduce_unit(
    engine: &ReductionEngine,
    family: TestFamily,
    unit: &UnitUnderTest,
    records: &[CalibrationPoint],
) -> UnitReduction {
    match family {
        TestFamily::Analog => {
            let buckets: BTreeSet<(usize, usize, usize)> = records
                .iter()
                .filter(|r| r.test != TestName::Noise)
                .map(|r| (r.axis_index, r.cycle_index, r.temp_index))
                .collect();
            UnitReduction {
                metrics: buckets
                    .into_iter()
                    .map(|(axis, cycle, temp)| engine.reduce_analog(records, unit, axis, cycle, temp))
                    .collect(),
                tumble: None,
            }
        }
        TestFamily::Digital => {
            let buckets: BTreeSet<(usize, usize)> = records
                .iter()
                .filter(|r| matches!(r.test, TestName::ThermalCalibration | TestName::Polarity))
                .map(|r| (r.axis_index, r.cycle_index))
                .collect();
            UnitReduction {
                metrics: buckets
                    .into_iter()
                    .map(|(axis, cycle)| engine.reduce_digital(records, unit, axis, cycle))
                    .collect(),
                tumble: None,
            }
        }
        TestFamily::Tumble => match reduction::tumble_matrices(records) {
            Ok((plus, minus)) => {
                let (metrics, coefficients) = engine.reduce_tumble(unit, &plus, &minus);
                UnitReduction {
                    metrics: vec![metrics],
                    tumble: coefficients,
                }
            }
            Err(err) => {
                let mut metrics = ReductionMetrics::new(unit, 0, 0, None);
                metrics.faults.push(format!("Tumble: {}", err));
                UnitReduction {
                    metrics: vec![metrics],
                    tumble: None,
                }
            }
        },
    }
}

/// Transport faults propagate; anything else is recorded and swallowed.
fn contain(
    report: &mut RunReport,
    step: impl fmt::Display,
    at: GridPosition,
    result: CalResult<()>,
) -> CalResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_transport() => {
            error!("{} stopped the run: {}", step, err);
            Err(err)
        }
        Err(err) => {
            warn!(
                "{} abandoned at axis {} cycle {} temp {}: {}",
                step, at.axis, at.cycle, at.temp, err
            );
            report.abandoned.push(AbandonedStep {
                step: step.to_string(),
                axis: at.axis,
                cycle: at.cycle,
                temp_index: at.temp,
                reason: err.to_string(),
            });
            Ok(())
        }
    }
}

fn note_degraded(report: &mut RunReport, outcome: Outcome<f64>) -> f64 {
    match outcome {
        Outcome::Success(value) => value,
        Outcome::Degraded { value, reason } => {
            report.degraded.push(reason);
            value
        }
    }
}

fn axis_output(sample: &SensorSample, axis: usize) -> f64 {
    match axis {
        0 => sample.x,
        1 => sample.y,
        _ => sample.z,
    }
}

/// Runs one part's calibration on a station.
pub struct CalibrationOrchestrator {
    station: Station,
    config: StationConfig,
    spec: SensorSpec,
    units: Vec<UnitUnderTest>,
    operator: Arc<dyn Operator>,
    logs: BTreeMap<Port, CalibrationLog>,
    records: BTreeMap<Port, Vec<CalibrationPoint>>,
    status: StatusBoard,
    mounted_axis: usize,
}

impl CalibrationOrchestrator {
    /// Validates the unit list against the part and opens one data file per
    /// unit under the configured data directory.
    ///
    /// # Errors
    /// - `Configuration` for an empty unit list, a unit of another part, a
    ///   port used twice, or an invalid part specification
    /// - `Io` when a data file cannot be opened
    pub fn new(
        station: Station,
        config: StationConfig,
        spec: SensorSpec,
        units: Vec<UnitUnderTest>,
        operator: Arc<dyn Operator>,
    ) -> CalResult<Self> {
        spec.validate()?;
        if units.is_empty() {
            return Err(CalError::Configuration("no units under test".into()));
        }
        let mut ports = BTreeSet::new();
        for unit in &units {
            if unit.part_no != spec.part_no {
                return Err(CalError::Configuration(format!(
                    "{} is part {}, this run is for {}",
                    unit.serial_no, unit.part_no, spec.part_no
                )));
            }
            if !ports.insert(unit.port) {
                return Err(CalError::Configuration(format!(
                    "{} assigned to more than one unit",
                    unit.port
                )));
            }
        }

        let mut logs = BTreeMap::new();
        for unit in &units {
            logs.insert(unit.port, CalibrationLog::open(&config.application.data_dir, unit)?);
        }

        Ok(Self {
            station,
            config,
            spec,
            units,
            operator,
            logs,
            records: BTreeMap::new(),
            status: StatusBoard::new(),
            mounted_axis: 0,
        })
    }

    /// Live position and phase, for observers of the run.
    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Records taken for the unit on `port` during this run.
    pub fn records(&self, port: Port) -> &[CalibrationPoint] {
        self.records.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Data file of the unit on `port`.
    pub fn log(&self, port: Port) -> Option<&CalibrationLog> {
        self.logs.get(&port)
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Runs the `family` sequence and reduces the collected data.
    ///
    /// The supply rails are switched on before the sequence and off after
    /// it, including when the sequence fails.
    ///
    /// # Errors
    /// - Transport faults from any instrument
    /// - `Configuration` when a digital or tumble run has no sensor bus
    pub async fn run(&mut self, family: TestFamily) -> CalResult<RunReport> {
        let mut report = RunReport::new(
            self.spec.part_no.clone(),
            family,
            self.config.application.station_name.clone(),
            self.units.clone(),
        );
        info!(
            "Starting {} run of {} on {} unit(s)",
            family,
            self.spec.part_no,
            self.units.len()
        );
        let _monitor = InactivityMonitor::spawn(
            self.status.clone(),
            Duration::from_secs_f64(self.config.operator.inactivity_minutes.max(0.0) * 60.0),
            Duration::from_secs(1),
        );
        self.status.set_stage(Phase::NotStarted.to_string());

        let sequence = match self.power(true).await {
            Ok(()) => match family {
                TestFamily::Analog => self.run_analog(&mut report).await,
                TestFamily::Digital => self.run_digital(&mut report).await,
                TestFamily::Tumble => self.run_tumble(&mut report).await,
            },
            Err(err) => Err(err),
        };
        let off = self.power(false).await;
        sequence?;
        off?;

        if family != TestFamily::Tumble {
            let engine = self.engine();
            for unit in &self.units {
                let reduced = reduce_unit(&engine, family, unit, self.records(unit.port));
                report.metrics.extend(reduced.metrics);
            }
        }
        self.status.set_stage(Phase::Done.to_string());
        report.finish();
        info!(
            "Run of {} finished: {}",
            self.spec.part_no,
            if report.passed() { "PASS" } else { "FAIL" }
        );
        Ok(report)
    }

    fn engine(&self) -> ReductionEngine {
        ReductionEngine::new(self.spec.clone(), self.config.site.local_gravity())
    }

    fn bus(&self) -> CalResult<Arc<dyn SensorBus>> {
        self.station
            .bus
            .clone()
            .ok_or_else(|| CalError::Configuration("no digital sensor bus on this station".into()))
    }

    async fn power(&self, on: bool) -> CalResult<()> {
        let Some(supply) = &self.station.supply else {
            return Ok(());
        };
        for rail in &self.config.supply.rails {
            if on {
                supply.apply(rail.channel, rail.volts, rail.current_limit).await?;
            }
            supply.set_output(rail.channel, on).await?;
        }
        Ok(())
    }

    fn countdown_tick(&self) -> Duration {
        self.config.chamber.countdown_tick()
    }

    async fn settle(&self) {
        countdown(
            "Settle",
            Duration::from_secs_f64(self.spec.settle_time_s.max(0.0)),
            self.countdown_tick(),
        )
        .await;
    }

    /// Homes the stage, levels it and lets the units warm up.
    async fn start_position(&mut self, report: &mut RunReport) -> CalResult<()> {
        self.station.motion.home().await?;
        let outcome = self.station.motion.move_to_angle(0.0).await?;
        note_degraded(report, outcome);
        countdown(
            "Warm-up",
            Duration::from_secs_f64(3.0 * self.spec.settle_time_s.max(0.0)),
            self.countdown_tick(),
        )
        .await;
        Ok(())
    }

    async fn level(&mut self, report: &mut RunReport) -> CalResult<()> {
        let outcome = self.station.motion.move_to_angle(0.0).await?;
        note_degraded(report, outcome);
        Ok(())
    }

    async fn remount(&mut self, report: &mut RunReport, axis: usize) -> CalResult<()> {
        if self.mounted_axis == axis {
            return Ok(());
        }
        self.level(report).await?;
        self.operator.remount(axis, self.spec.mount_label(axis)).await?;
        self.status.touch();
        self.mounted_axis = axis;
        Ok(())
    }

    /// Temperature steps for `cycle`. Without a chamber, or when the part
    /// has no thermal test, a single ambient step at index 0.
    fn temperature_steps(&self, cycle: usize, thermal_test: bool) -> Vec<(usize, Option<TemperatureStep>)> {
        let plan = self.spec.temperature_plan(cycle);
        if thermal_test && !plan.is_empty() {
            if self.station.thermal.is_some() {
                return plan.into_iter().map(|step| (step.index, Some(step))).collect();
            }
            warn!(
                "{} asks for {} temperature step(s) but the station has no chamber; sampling at ambient",
                self.spec.part_no,
                plan.len()
            );
        }
        vec![(0, None)]
    }

    async fn reach_temperature(&self, report: &mut RunReport, step: TemperatureStep) -> CalResult<()> {
        let Some(thermal) = &self.station.thermal else {
            return Ok(());
        };
        self.status.set_stage(ThermalPhase::Ramp.to_string());
        let outcome = thermal
            .ramp_to_temperature(
                &self.station.scanner,
                step.target,
                step.tolerance,
                self.config.chamber.ramp_timeout(),
            )
            .await?;
        note_degraded(report, outcome);

        self.status.set_stage(ThermalPhase::Soak.to_string());
        let outcome = thermal
            .soak_at_temperature(
                &self.station.scanner,
                step.target,
                step.tolerance,
                self.spec.soak_time_min,
            )
            .await?;
        note_degraded(report, outcome);
        self.status.set_stage(ThermalPhase::Sample.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------

    /// Moves to `angle`, settles, samples every unit and logs the records.
    /// Returns the samples keyed by port; units without data are missing.
    async fn sample_at(
        &mut self,
        report: &mut RunReport,
        angle: f64,
        test: TestName,
        at: GridPosition,
    ) -> CalResult<BTreeMap<Port, SensorSample>> {
        let outcome = self.station.motion.move_to_angle(angle).await?;
        let achieved = note_degraded(report, outcome);
        self.settle().await;
        self.acquire_and_log(report, test, at, achieved).await
    }

    async fn acquire_and_log(
        &mut self,
        report: &mut RunReport,
        test: TestName,
        at: GridPosition,
        angle: f64,
    ) -> CalResult<BTreeMap<Port, SensorSample>> {
        let samples = if self.spec.output_type.is_digital() {
            self.acquire_digital(report).await?
        } else {
            self.acquire_analog(report).await?
        };
        let station = self.config.application.station_name.clone();
        for (&port, sample) in &samples {
            let point = CalibrationPoint::new(
                station.clone(),
                test,
                at.axis,
                at.cycle,
                at.temp,
                angle,
                *sample,
            );
            self.keep(port, point)?;
        }
        Ok(samples)
    }

    fn keep(&mut self, port: Port, point: CalibrationPoint) -> CalResult<()> {
        if let Some(log) = self.logs.get(&port) {
            log.append(&point)?;
        }
        self.records.entry(port).or_default().push(point);
        Ok(())
    }

    async fn acquire_analog(&self, report: &mut RunReport) -> CalResult<BTreeMap<Port, SensorSample>> {
        let mode = SenseMode::from(self.spec.output_type);
        let ports: Vec<Port> = self.units.iter().map(|u| u.port).collect();
        let attempts = self.config.daq.data_attempts.max(1);
        for attempt in 1..=attempts {
            match self.station.scanner.read_data_from_scan(mode, &ports).await {
                Ok(Outcome::Success(scan)) if !scan.is_empty() => {
                    let plate = scan.ambient.plate;
                    return Ok(scan
                        .ports
                        .into_iter()
                        .map(|(port, r)| {
                            (
                                port,
                                SensorSample {
                                    x: r.x,
                                    y: r.y,
                                    z: 0.0,
                                    unit_temp: r.t,
                                    plate_temp: plate,
                                },
                            )
                        })
                        .collect());
                }
                Ok(_) => warn!("No sensor data on attempt {}/{}", attempt, attempts),
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => warn!("Sensor read attempt {}/{} failed: {}", attempt, attempts, err),
            }
        }
        warn!("No sensor data after {} attempts, skipping point", attempts);
        report.skipped_points += 1;
        Ok(BTreeMap::new())
    }

    async fn acquire_digital(&self, report: &mut RunReport) -> CalResult<BTreeMap<Port, SensorSample>> {
        let bus = self.bus()?;
        let ambient = self.station.scanner.ambient_temperatures().await;
        let attempts = self.config.daq.data_attempts.max(1);
        let mut samples = BTreeMap::new();
        for unit in &self.units {
            let mut reading = None;
            for attempt in 1..=attempts {
                match bus.read_outputs(unit.port).await {
                    Ok(r) => {
                        reading = Some(r);
                        break;
                    }
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(
                        "{} read attempt {}/{} failed: {}",
                        unit.serial_no, attempt, attempts, err
                    ),
                }
            }
            match reading {
                Some(r) => {
                    samples.insert(
                        unit.port,
                        SensorSample {
                            x: r.x,
                            y: r.y,
                            z: r.z,
                            unit_temp: r.temperature,
                            plate_temp: ambient.plate,
                        },
                    );
                }
                None => {
                    warn!("No data from {}, skipping point", unit.serial_no);
                    report.skipped_points += 1;
                }
            }
        }
        Ok(samples)
    }

    // ------------------------------------------------------------------
    // Sub-sequences
    // ------------------------------------------------------------------

    /// Samples at 0°, steps by `step` and samples again. A decreasing
    /// output on the tested axis is reported as reversed polarity.
    async fn polarity_check(&mut self, report: &mut RunReport, at: GridPosition, step: f64) -> CalResult<()> {
        let null = self.sample_at(report, 0.0, TestName::Polarity, at).await?;
        let outcome = self.station.motion.move_incremental(step).await?;
        let achieved = note_degraded(report, outcome);
        self.settle().await;
        let stepped = self
            .acquire_and_log(report, TestName::Polarity, at, achieved)
            .await?;
        for unit in &self.units {
            if let (Some(before), Some(after)) = (null.get(&unit.port), stepped.get(&unit.port)) {
                if axis_output(after, at.axis) < axis_output(before, at.axis) {
                    warn!(
                        "{} on {}: output falls on a positive step, polarity reversed on axis {}",
                        unit.serial_no, unit.port, at.axis
                    );
                }
            }
        }
        self.level(report).await
    }

    /// -90° Y, the sweep points, +90° Y, then the 0°/180° Z pair.
    async fn linearity_sweep(&mut self, report: &mut RunReport, at: GridPosition, points: &[f64]) -> CalResult<()> {
        self.sample_at(report, -90.0, TestName::YTransverse, at).await?;
        for &angle in points {
            self.sample_at(report, angle, TestName::Linearity, at).await?;
        }
        self.sample_at(report, 90.0, TestName::YTransverse, at).await?;
        self.sample_at(report, 0.0, TestName::ZTransverse, at).await?;
        self.sample_at(report, 180.0, TestName::ZTransverse, at).await?;
        self.level(report).await
    }

    async fn full_scale(&mut self, report: &mut RunReport, at: GridPosition, points: &[f64]) -> CalResult<()> {
        let (Some(&min), Some(&max)) = (points.first(), points.last()) else {
            return Err(CalError::Configuration("empty calibration grid".into()));
        };
        self.sample_at(report, max, TestName::FullScale, at).await?;
        self.sample_at(report, min, TestName::FullScale, at).await?;
        self.level(report).await
    }

    async fn static_pair(
        &mut self,
        report: &mut RunReport,
        at: GridPosition,
        test: TestName,
        first: f64,
        second: f64,
    ) -> CalResult<()> {
        self.sample_at(report, first, test, at).await?;
        self.sample_at(report, second, test, at).await?;
        self.level(report).await
    }

    /// Every point as a thermal calibration record, for digital parts.
    async fn thermal_sweep(&mut self, report: &mut RunReport, at: GridPosition, points: &[f64]) -> CalResult<()> {
        for &angle in points {
            self.sample_at(report, angle, TestName::ThermalCalibration, at).await?;
        }
        self.level(report).await
    }

    /// Operator-entered bandwidth, one record per unit with the value in the
    /// angle column.
    async fn bandwidth_check(&mut self, at: GridPosition) -> CalResult<()> {
        let station = self.config.application.station_name.clone();
        for unit in self.units.clone() {
            let entry = self.operator.enter_bandwidth(&unit).await?;
            self.status.touch();
            let Some(hz) = entry else {
                warn!("Bandwidth of {} not entered", unit.serial_no);
                continue;
            };
            info!("Bandwidth of {}: {} Hz", unit.serial_no, hz);
            let point = CalibrationPoint::new(
                station.clone(),
                TestName::Bandwidth,
                at.axis,
                at.cycle,
                at.temp,
                hz,
                SensorSample::default(),
            );
            self.keep(unit.port, point)?;
        }
        Ok(())
    }

    /// AC voltage on each unit's X/Y channels at rest.
    async fn noise_check(&mut self, report: &mut RunReport, at: GridPosition) -> CalResult<()> {
        self.level(report).await?;
        self.settle().await;
        let ports: Vec<Port> = self.units.iter().map(|u| u.port).collect();
        let readings = self
            .station
            .scanner
            .scan_ports(ScanFunction::AcVoltage, &ports, 1)
            .await?;
        let plate = self.station.scanner.plate_temperature().await;
        let station = self.config.application.station_name.clone();
        for (port, reading) in readings {
            info!("{} noise X {:.6} Y {:.6} Vac", port, reading.x, reading.y);
            let point = CalibrationPoint::new(
                station.clone(),
                TestName::Noise,
                at.axis,
                at.cycle,
                at.temp,
                0.0,
                SensorSample {
                    x: reading.x,
                    y: reading.y,
                    z: 0.0,
                    unit_temp: plate,
                    plate_temp: plate,
                },
            );
            self.keep(port, point)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Families
    // ------------------------------------------------------------------

    async fn run_analog(&mut self, report: &mut RunReport) -> CalResult<()> {
        let points = self.spec.calibration_points()?;
        let step = match points.as_slice() {
            [first, second, ..] => (second - first).abs(),
            _ => 1.0,
        };
        let plan = phase_plan(&self.spec.tests);
        info!("Analog plan: {:?}", plan);
        self.start_position(report).await?;

        for axis in 0..self.spec.axes_no {
            self.remount(report, axis).await?;
            for cycle in 0..self.spec.cycles {
                let at0 = GridPosition { axis, cycle, temp: 0 };
                self.status.set_position(axis, cycle, 0);
                if plan.contains(&Phase::PolarityCheck) {
                    self.status.set_stage(Phase::PolarityCheck.to_string());
                    let result = self.polarity_check(report, at0, step).await;
                    contain(report, Phase::PolarityCheck, at0, result)?;
                }

                for (temp, target) in self.temperature_steps(cycle, self.spec.tests.over_temp) {
                    let at = GridPosition { axis, cycle, temp };
                    self.status.set_position(axis, cycle, temp);
                    if let Some(target) = target {
                        self.reach_temperature(report, target).await?;
                    }
                    for phase in plan.iter().copied().filter(|p| p.is_per_temperature()) {
                        self.status.set_stage(phase.to_string());
                        let result = match phase {
                            Phase::LinearitySweep => self.linearity_sweep(report, at, &points).await,
                            Phase::FullScale => self.full_scale(report, at, &points).await,
                            Phase::BiasCheck => {
                                self.static_pair(report, at, TestName::ZTransverse, 0.0, 180.0)
                                    .await
                            }
                            Phase::MisalignmentCheck => {
                                self.static_pair(report, at, TestName::YTransverse, -90.0, 90.0)
                                    .await
                            }
                            _ => Ok(()),
                        };
                        contain(report, phase, at, result)?;
                    }
                }

                self.status.set_position(axis, cycle, 0);
                if plan.contains(&Phase::BandwidthCheck) {
                    self.status.set_stage(Phase::BandwidthCheck.to_string());
                    let result = self.bandwidth_check(at0).await;
                    contain(report, Phase::BandwidthCheck, at0, result)?;
                }
                if plan.contains(&Phase::NoiseCheck) {
                    self.status.set_stage(Phase::NoiseCheck.to_string());
                    let result = self.noise_check(report, at0).await;
                    contain(report, Phase::NoiseCheck, at0, result)?;
                }
            }
        }
        self.station.motion.home().await
    }

    async fn run_digital(&mut self, report: &mut RunReport) -> CalResult<()> {
        let bus = self.bus()?;
        for unit in &self.units {
            bus.configure(unit.port, false).await?;
        }
        let points = self.spec.calibration_points()?;
        let step = match points.as_slice() {
            [first, second, ..] => (second - first).abs(),
            _ => 1.0,
        };
        self.start_position(report).await?;

        for cycle in 0..self.spec.cycles {
            for axis in 0..self.spec.axes_no {
                self.remount(report, axis).await?;
                let at0 = GridPosition { axis, cycle, temp: 0 };
                self.status.set_position(axis, cycle, 0);
                if self.spec.tests.polarity {
                    self.status.set_stage(Phase::PolarityCheck.to_string());
                    let result = self.polarity_check(report, at0, step).await;
                    contain(report, Phase::PolarityCheck, at0, result)?;
                }
                for (temp, target) in self.temperature_steps(cycle, true) {
                    let at = GridPosition { axis, cycle, temp };
                    self.status.set_position(axis, cycle, temp);
                    if let Some(target) = target {
                        self.reach_temperature(report, target).await?;
                    }
                    self.status.set_stage(TestName::ThermalCalibration.to_string());
                    let result = self.thermal_sweep(report, at, &points).await;
                    contain(report, TestName::ThermalCalibration, at, result)?;
                }
            }

            if cycle == 0 {
                for unit in self.units.clone() {
                    let Some(path) = self.logs.get(&unit.port).map(|l| l.path().to_path_buf()) else {
                        continue;
                    };
                    info!("Loading lookup table into {} from '{}'", unit.serial_no, path.display());
                    let result = bus.load_lookup_table(unit.port, &path).await;
                    contain(report, "Lookup table", GridPosition { axis: 0, cycle, temp: 0 }, result)?;
                }
            }
        }
        self.station.motion.home().await
    }

    /// Six orientations: ±90° on two mounts, then 180° and 0°.
    async fn tumble_sequence(&mut self, report: &mut RunReport) -> CalResult<()> {
        for mount in 0..2 {
            self.remount(report, mount).await?;
            let at = GridPosition { axis: mount, cycle: 0, temp: 0 };
            self.status.set_position(mount, 0, 0);
            self.sample_at(report, 90.0, TestName::Tumble, at).await?;
            self.sample_at(report, -90.0, TestName::Tumble, at).await?;
        }
        let at = GridPosition { axis: 1, cycle: 0, temp: 0 };
        self.sample_at(report, 180.0, TestName::Tumble, at).await?;
        self.sample_at(report, 0.0, TestName::Tumble, at).await?;
        Ok(())
    }

    async fn run_tumble(&mut self, report: &mut RunReport) -> CalResult<()> {
        let bus = self.bus()?;
        for unit in &self.units {
            bus.configure(unit.port, true).await?;
        }
        self.level(report).await?;
        self.operator
            .acknowledge(&format!(
                "Mount every unit in the {} orientation for the tumble test.",
                self.spec.mount_label(0)
            ))
            .await?;
        self.status.touch();
        self.status.set_stage(TestName::Tumble.to_string());

        let origin = GridPosition { axis: 0, cycle: 0, temp: 0 };
        let result = self.tumble_sequence(report).await;
        contain(report, TestName::Tumble, origin, result)?;
        self.level(report).await?;

        let engine = self.engine();
        for unit in self.units.clone() {
            let reduced = reduce_unit(&engine, TestFamily::Tumble, &unit, self.records(unit.port));
            report.metrics.extend(reduced.metrics);
            if let Some(coefficients) = reduced.tumble {
                info!("Loading tumble coefficients into {}", unit.serial_no);
                let result = bus.load_tumble_coefficients(unit.port, &coefficients).await;
                contain(report, "Tumble coefficients", origin, result)?;
            }
        }
        Ok(())
    }
}
