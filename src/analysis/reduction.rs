//! Reduction of calibration records into performance metrics.
//!
//! Every reduction reads [`CalibrationPoint`]s for one unit and produces
//! [`Metric`]s, each compared with the matching [`ToleranceLimits`] entry.
//! A failed comparison is a [`Verdict::Fail`], not an error; numerical faults
//! (too few points, singular matrices) are recorded in
//! [`ReductionMetrics::faults`] and only cost the metric they belong to.
//!
//! ## Column conventions
//!
//! - Scale factor, nonlinearity, bias and output-axis misalignment read the
//!   column of the axis under test (X, Y, Z for axes 0, 1, 2).
//! - Pendulous-axis misalignment and cross-axis error read the transverse
//!   column: Y when testing axis 0, X when testing axes 1 and 2.
//! - The 0°/180° and ±90° pairs are taken in record order: the first
//!   Z-transverse record is the 0° sample, the first Y-transverse record the
//!   -90° sample.

use crate::analysis::linear_algebra::{self, solve_least_squares, LeastSquaresFit};
use crate::analysis::statistics;
use crate::analysis::tolerance::Limit;
use crate::calibration::record::{CalibrationPoint, TestName};
use crate::error::{CalError, CalResult};
use crate::instrument::TumbleCoefficients;
use crate::sensor::{SensorSpec, ToleranceLimits, UnitUnderTest};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Reference temperature for bias-over-temperature, °C.
pub const REFERENCE_TEMP_C: f64 = 25.0;

// ============================================================================
// Core formulas
// ============================================================================

/// Bias from the 0°/180° pair, input units.
pub fn compute_bias(out_0: f64, out_180: f64, scale_factor: f64) -> f64 {
    (out_0 + out_180) / (2.0 * scale_factor)
}

/// Output-axis misalignment (Mza) from the 0°/180° pair, degrees.
pub fn compute_output_axis(out_0: f64, out_180: f64, scale_factor: f64, gravity: f64) -> f64 {
    ((out_0 - out_180) / (2.0 * gravity * scale_factor)).asin().to_degrees()
}

/// Pendulous-axis misalignment (Mya) from the ±90° pair, degrees.
pub fn compute_pendulous_axis(out_neg_90: f64, out_pos_90: f64, scale_factor: f64, gravity: f64) -> f64 {
    ((out_pos_90 - out_neg_90) / (2.0 * gravity * scale_factor)).asin().to_degrees()
}

pub fn compute_input_axis_misalignment(moa: f64, mpa: f64) -> f64 {
    moa.hypot(mpa)
}

pub fn compute_full_scale(max: f64, min: f64) -> f64 {
    (max - min) / 2.0
}

/// Largest deviation of `y` from the polynomial `coefficients`, in percent of
/// the full range of `y`. Zero when `y` has no range.
pub fn nonlinearity(x: &[f64], y: &[f64], coefficients: &[f64]) -> f64 {
    let (Some(max), Some(min)) = (statistics::max(y), statistics::min(y)) else {
        return 0.0;
    };
    let range = max - min;
    if range == 0.0 {
        return 0.0;
    }
    linear_algebra::polynomial(x, coefficients)
        .iter()
        .zip(y)
        .map(|(fit, actual)| 100.0 * (fit - actual).abs() / range)
        .fold(0.0, f64::max)
}

/// Orthonormalization from tumble readings.
///
/// Row `i` of `plus`/`minus` holds the X, Y, Z counts with axis `i` pointing
/// up/down. `W = plus - minus`, the orthonormal matrix is
/// `inv(W) · 2 · nominal_adc` and each offset is `diag(plus + minus)ᵢ / 3`.
///
/// # Errors
/// `SingularMatrix` when `W` cannot be inverted.
pub fn tumble_coefficients(
    plus: &Matrix3<f64>,
    minus: &Matrix3<f64>,
    nominal_adc: f64,
) -> CalResult<TumbleCoefficients> {
    let w = linear_algebra::subtract(plus, minus);
    let orthonormal = linear_algebra::scale(&linear_algebra::invert(&w)?, 2.0 * nominal_adc);
    let sum = linear_algebra::add(plus, minus);
    let offset = Vector3::new(sum[(0, 0)], sum[(1, 1)], sum[(2, 2)]) / 3.0;
    Ok(TumbleCoefficients { orthonormal, offset })
}

/// Rebuilds the tumble `plus`/`minus` count matrices from Tumble records.
///
/// Records at about +90° fill row `axis_index` of `plus`, about -90° the same
/// row of `minus`. The 0° and 180° records fill row 2 of `plus` and `minus`.
///
/// # Errors
/// `InsufficientData` unless all six rows were found.
pub fn tumble_matrices(records: &[CalibrationPoint]) -> CalResult<(Matrix3<f64>, Matrix3<f64>)> {
    let mut plus = Matrix3::zeros();
    let mut minus = Matrix3::zeros();
    let mut filled = [[false; 3]; 2];
    for record in records.iter().filter(|r| r.test == TestName::Tumble) {
        let angle = record.angle;
        let (target, side, row) = if (angle - 90.0).abs() < 45.0 {
            (&mut plus, 0, record.axis_index)
        } else if (angle + 90.0).abs() < 45.0 {
            (&mut minus, 1, record.axis_index)
        } else if angle.abs() < 45.0 {
            (&mut plus, 0, 2)
        } else {
            (&mut minus, 1, 2)
        };
        if row > 2 {
            continue;
        }
        target.set_row(
            row,
            &Vector3::new(record.x_output, record.y_output, record.z_output).transpose(),
        );
        filled[side][row] = true;
    }
    if filled.iter().flatten().all(|f| *f) {
        Ok((plus, minus))
    } else {
        Err(CalError::InsufficientData(format!(
            "tumble needs six orientations, have plus {:?} minus {:?}",
            filled[0], filled[1]
        )))
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ScaleFactor,
    Intercept,
    Nonlinearity,
    FullScale,
    Bias,
    OutputAxisMisalignment,
    PendulousAxisMisalignment,
    InputAxisMisalignment,
    Bias25C,
    BiasTempSensitivity,
    Accuracy,
    VerificationError,
    CrossAxis,
    Bandwidth,
    Polarity,
    OrthonormalElement,
}

impl MetricKind {
    pub fn label(self) -> &'static str {
        match self {
            MetricKind::ScaleFactor => "Scale factor",
            MetricKind::Intercept => "Y-intercept",
            MetricKind::Nonlinearity => "Linearity (% FRO)",
            MetricKind::FullScale => "Full-scale output",
            MetricKind::Bias => "Bias",
            MetricKind::OutputAxisMisalignment => "Z-Transverse Axis Misalignment (deg)",
            MetricKind::PendulousAxisMisalignment => "Y-Transverse Axis Misalignment (deg)",
            MetricKind::InputAxisMisalignment => "Input Axis Misalignment (deg)",
            MetricKind::Bias25C => "Bias at 25 C",
            MetricKind::BiasTempSensitivity => "BTS (ppm/C)",
            MetricKind::Accuracy => "Relative accuracy",
            MetricKind::VerificationError => "Max error",
            MetricKind::CrossAxis => "Max cross-axis error",
            MetricKind::Bandwidth => "Bandwidth (Hz)",
            MetricKind::Polarity => "Polarity",
            MetricKind::OrthonormalElement => "Max orthonormal element deviation",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// No limit applies to this metric.
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    pub value: f64,
    pub limit: Option<Limit>,
    pub verdict: Verdict,
}

impl Metric {
    /// Metric compared against `limit`; `None` leaves it unchecked.
    pub fn checked(kind: MetricKind, value: f64, limit: Option<Limit>) -> Self {
        let verdict = match limit {
            Some(limit) if limit.contains(value) => Verdict::Pass,
            Some(_) => Verdict::Fail,
            None => Verdict::NotChecked,
        };
        Self {
            kind,
            value,
            limit,
            verdict,
        }
    }

    pub fn unchecked(kind: MetricKind, value: f64) -> Self {
        Self::checked(kind, value, None)
    }
}

/// Metrics for one unit, axis and cycle (and temperature index where the
/// reduction is per temperature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionMetrics {
    pub port: String,
    pub serial_no: String,
    pub axis: usize,
    pub cycle: usize,
    pub temp_index: Option<usize>,
    pub metrics: Vec<Metric>,
    /// Numerical faults that prevented a metric from being computed.
    pub faults: Vec<String>,
}

impl ReductionMetrics {
    pub fn new(unit: &UnitUnderTest, axis: usize, cycle: usize, temp_index: Option<usize>) -> Self {
        Self {
            port: unit.port.to_string(),
            serial_no: unit.serial_no.clone(),
            axis,
            cycle,
            temp_index,
            metrics: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    fn fault(&mut self, what: &str, err: &CalError) {
        warn!(
            "{} axis {} cycle {}: {} not computed: {}",
            self.serial_no, self.axis, self.cycle, what, err
        );
        self.faults.push(format!("{}: {}", what, err));
    }

    pub fn get(&self, kind: MetricKind) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.kind == kind)
    }

    pub fn scale_factor(&self) -> Option<f64> {
        self.get(MetricKind::ScaleFactor).map(|m| m.value)
    }

    /// No metric failed its limit.
    pub fn passed(&self) -> bool {
        self.metrics.iter().all(|m| m.verdict != Verdict::Fail)
    }
}

/// Bias-over-temperature result for one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasOverTemperature {
    /// `(mean plate temperature, bias)` per temperature index.
    pub points: Vec<(f64, f64)>,
    pub bias_25c: f64,
    /// Bias temperature sensitivity, ppm/°C.
    pub bts: f64,
}

// ============================================================================
// Engine
// ============================================================================

/// Reduces records of one part number.
pub struct ReductionEngine {
    spec: SensorSpec,
    gravity: f64,
}

impl ReductionEngine {
    /// `gravity` is the local gravity used by the misalignment formulas.
    pub fn new(spec: SensorSpec, gravity: f64) -> Self {
        Self { spec, gravity }
    }

    pub fn spec(&self) -> &SensorSpec {
        &self.spec
    }

    fn limits(&self) -> &ToleranceLimits {
        &self.spec.limits
    }

    fn scale_factor_limit(&self) -> Limit {
        let (low, high) = self.limits().scale_factor_bounds();
        Limit::Range { low, high }
    }

    /// Analog reduction of one `(axis, cycle, temp)` bucket.
    ///
    /// Scale factor and nonlinearity come from the linearity sweep (or the
    /// two full-scale points), bias and Mza from the Z-transverse pair, Mya
    /// from the Y-transverse pair.
    pub fn reduce_analog(
        &self,
        records: &[CalibrationPoint],
        unit: &UnitUnderTest,
        axis: usize,
        cycle: usize,
        temp: usize,
    ) -> ReductionMetrics {
        let mut out = ReductionMetrics::new(unit, axis, cycle, Some(temp));
        let bucket: Vec<&CalibrationPoint> =
            records.iter().filter(|r| r.in_bucket(axis, cycle, temp)).collect();
        let sensor_type = self.spec.sensor_type;

        let sweep: Vec<&CalibrationPoint> = bucket
            .iter()
            .copied()
            .filter(|r| r.test == TestName::Linearity)
            .collect();
        let full_scale: Vec<&CalibrationPoint> = bucket
            .iter()
            .copied()
            .filter(|r| r.test == TestName::FullScale)
            .collect();

        let mut scale_factor = None;
        if !sweep.is_empty() {
            let x: Vec<f64> = sweep.iter().map(|r| r.input(sensor_type)).collect();
            let y: Vec<f64> = sweep.iter().map(|r| r.output(axis)).collect();
            match solve_least_squares(&x, &y, 1) {
                Ok(fit) => {
                    debug!("{} axis {} fit r² = {:.9}", unit.serial_no, axis, fit.r_squared);
                    let max_nl = nonlinearity(&x, &y, &fit.coefficients);
                    out.push(Metric::checked(
                        MetricKind::ScaleFactor,
                        fit.slope(),
                        Some(self.scale_factor_limit()),
                    ));
                    out.push(Metric::unchecked(MetricKind::Intercept, fit.intercept()));
                    out.push(Metric::checked(
                        MetricKind::Nonlinearity,
                        max_nl,
                        self.limits()
                            .linearity_for(axis)
                            .map(|max| Limit::MaxAbs { max }),
                    ));
                    scale_factor = Some(fit.slope());
                }
                Err(err) => out.fault("scale factor", &err),
            }
        } else if !full_scale.is_empty() {
            match self.reduce_full_scale(&full_scale, axis) {
                Ok((fso, fit)) => {
                    out.push(Metric::checked(
                        MetricKind::ScaleFactor,
                        fit.slope(),
                        Some(self.scale_factor_limit()),
                    ));
                    out.push(Metric::unchecked(MetricKind::Intercept, fit.intercept()));
                    out.push(Metric::checked(
                        MetricKind::FullScale,
                        fso,
                        self.limits().fso.map(|target| Limit::Symmetric {
                            target,
                            tol: (target * self.limits().scale_factor_tol).abs(),
                        }),
                    ));
                    scale_factor = Some(fit.slope());
                }
                Err(err) => out.fault("full scale", &err),
            }
        }

        let z_pair: Vec<f64> = bucket
            .iter()
            .filter(|r| r.test == TestName::ZTransverse)
            .map(|r| r.output(axis))
            .collect();
        let y_pair: Vec<f64> = bucket
            .iter()
            .filter(|r| r.test == TestName::YTransverse)
            .map(|r| r.transverse_output(axis))
            .collect();

        let mut moa = None;
        if !z_pair.is_empty() {
            match (pair(&z_pair, "0/180"), scale_factor) {
                (Ok((out_0, out_180)), Some(sf)) => {
                    out.push(Metric::checked(
                        MetricKind::Bias,
                        compute_bias(out_0, out_180, sf),
                        Some(Limit::MaxAbs { max: self.limits().bias }),
                    ));
                    let mza = compute_output_axis(out_0, out_180, sf, self.gravity);
                    out.push(Metric::checked(
                        MetricKind::OutputAxisMisalignment,
                        mza,
                        Some(Limit::MaxAbs { max: self.limits().moa }),
                    ));
                    moa = Some(mza);
                }
                (Err(err), _) => out.fault("bias", &err),
                (_, None) => out.fault("bias", &no_scale_factor()),
            }
        }

        let mut mpa = None;
        if !y_pair.is_empty() {
            match (pair(&y_pair, "±90"), scale_factor) {
                (Ok((neg_90, pos_90)), Some(sf)) => {
                    let mya = compute_pendulous_axis(neg_90, pos_90, sf, self.gravity);
                    out.push(Metric::checked(
                        MetricKind::PendulousAxisMisalignment,
                        mya,
                        Some(Limit::MaxAbs { max: self.limits().mpa }),
                    ));
                    mpa = Some(mya);
                }
                (Err(err), _) => out.fault("pendulous axis", &err),
                (_, None) => out.fault("pendulous axis", &no_scale_factor()),
            }
        }

        if let (Some(moa), Some(mpa)) = (moa, mpa) {
            out.push(Metric::checked(
                MetricKind::InputAxisMisalignment,
                compute_input_axis_misalignment(moa, mpa),
                self.limits().input_axis.map(|max| Limit::MaxAbs { max }),
            ));
        }

        let polarity: Vec<&CalibrationPoint> = bucket
            .iter()
            .copied()
            .filter(|r| r.test == TestName::Polarity)
            .collect();
        if !polarity.is_empty() {
            match self.polarity(&polarity, axis) {
                Ok(metric) => out.push(metric),
                Err(err) => out.fault("polarity", &err),
            }
        }
        if let Some(entry) = bucket.iter().rev().find(|r| r.test == TestName::Bandwidth) {
            out.push(Metric::checked(
                MetricKind::Bandwidth,
                entry.angle,
                self.limits()
                    .bandwidth
                    .map(|bw| Limit::Range { low: bw.low, high: bw.high }),
            ));
        }
        out
    }

    /// `+1` when the output rises with the input between the two polarity
    /// records, `-1` when the unit is wired backwards.
    pub fn polarity(&self, records: &[&CalibrationPoint], axis: usize) -> CalResult<Metric> {
        let [null, step] = records else {
            return Err(CalError::InsufficientData(format!(
                "polarity needs 2 records, got {}",
                records.len()
            )));
        };
        let sensor_type = self.spec.sensor_type;
        let d_in = step.input(sensor_type) - null.input(sensor_type);
        let d_out = step.output(axis) - null.output(axis);
        let sign = if d_in * d_out < 0.0 { -1.0 } else { 1.0 };
        Ok(Metric::checked(
            MetricKind::Polarity,
            sign,
            Some(Limit::Symmetric { target: 1.0, tol: 0.0 }),
        ))
    }

    /// Full-scale output and the two-point fit through the sweep extremes.
    fn reduce_full_scale(
        &self,
        records: &[&CalibrationPoint],
        axis: usize,
    ) -> CalResult<(f64, LeastSquaresFit)> {
        let x: Vec<f64> = records.iter().map(|r| r.input(self.spec.sensor_type)).collect();
        let y: Vec<f64> = records.iter().map(|r| r.output(axis)).collect();
        let fit = solve_least_squares(&x, &y, 1)?;
        let (Some(max), Some(min)) = (statistics::max(&y), statistics::min(&y)) else {
            return Err(CalError::InsufficientData("no full-scale outputs".into()));
        };
        Ok((compute_full_scale(max, min), fit))
    }

    /// Records of one axis and cycle grouped by temperature index.
    fn temperature_groups<'a>(
        &self,
        records: &'a [CalibrationPoint],
        axis: usize,
        cycle: usize,
    ) -> BTreeMap<usize, Vec<&'a CalibrationPoint>> {
        let mut groups: BTreeMap<usize, Vec<&CalibrationPoint>> = BTreeMap::new();
        for record in records.iter().filter(|r| {
            r.axis_index == axis
                && r.cycle_index == cycle
                && matches!(r.test, TestName::ThermalCalibration | TestName::Linearity)
        }) {
            groups.entry(record.temp_index).or_default().push(record);
        }
        groups
    }

    /// Bias-over-temperature for one axis and cycle.
    ///
    /// Each temperature's bias is the intercept of an order-1 input→output
    /// fit. A cubic (or lower, with fewer temperatures) through bias versus
    /// mean plate temperature is evaluated at 25 °C. BTS compares the
    /// mid-sweep output of the first and last temperatures.
    ///
    /// # Errors
    /// `InsufficientData` with fewer than two temperatures.
    pub fn bias_over_temperature(
        &self,
        records: &[CalibrationPoint],
        axis: usize,
        cycle: usize,
    ) -> CalResult<BiasOverTemperature> {
        let groups = self.temperature_groups(records, axis, cycle);
        if groups.len() < 2 {
            return Err(CalError::InsufficientData(format!(
                "bias over temperature needs 2 temperatures, got {}",
                groups.len()
            )));
        }
        let mut points = Vec::with_capacity(groups.len());
        let mut zero_tilt = Vec::with_capacity(groups.len());
        for group in groups.values() {
            let x: Vec<f64> = group.iter().map(|r| r.input(self.spec.sensor_type)).collect();
            let y: Vec<f64> = group.iter().map(|r| r.output(axis)).collect();
            let fit = solve_least_squares(&x, &y, 1)?;
            let plates: Vec<f64> = group.iter().map(|r| r.plate_temp).collect();
            let plate = statistics::mean(&plates)
                .ok_or_else(|| CalError::InsufficientData("no plate temperatures".into()))?;
            points.push((plate, fit.intercept()));
            zero_tilt.push(group[group.len() / 2].output(axis));
        }

        let order = (points.len() - 1).min(3);
        let temps: Vec<f64> = points.iter().map(|p| p.0).collect();
        let biases: Vec<f64> = points.iter().map(|p| p.1).collect();
        let fit = solve_least_squares(&temps, &biases, order)?;
        let bias_25c = fit.evaluate(REFERENCE_TEMP_C);

        let (first, last) = (points[0].0, points[points.len() - 1].0);
        let delta_temp = first - last;
        if delta_temp == 0.0 {
            return Err(CalError::InsufficientData(
                "first and last plate temperatures are equal".into(),
            ));
        }
        let delta_zero = zero_tilt[0] - zero_tilt[zero_tilt.len() - 1];
        let bts = 1e6 * (delta_zero / delta_temp).abs();
        Ok(BiasOverTemperature {
            points,
            bias_25c,
            bts,
        })
    }

    /// `max |input - (output + bias_25c)|` over the axis/cycle records.
    pub fn accuracy(
        &self,
        records: &[CalibrationPoint],
        axis: usize,
        cycle: usize,
        bias_25c: f64,
    ) -> CalResult<f64> {
        let errors: Vec<f64> = self
            .temperature_groups(records, axis, cycle)
            .values()
            .flatten()
            .map(|r| (r.input(self.spec.sensor_type) - (r.output(axis) + bias_25c)).abs())
            .collect();
        statistics::max(&errors)
            .ok_or_else(|| CalError::InsufficientData("no accuracy records".into()))
    }

    /// Largest signed `input - output` over the axis/cycle records.
    pub fn verification_error(
        &self,
        records: &[CalibrationPoint],
        axis: usize,
        cycle: usize,
    ) -> CalResult<f64> {
        let errors: Vec<f64> = self
            .temperature_groups(records, axis, cycle)
            .values()
            .flatten()
            .map(|r| r.input(self.spec.sensor_type) - r.output(axis))
            .collect();
        statistics::max(&errors)
            .ok_or_else(|| CalError::InsufficientData("no verification records".into()))
    }

    /// Digital linearity: per temperature, fit output→input and take the
    /// largest deviation in percent of the input range.
    pub fn digital_linearity(
        &self,
        records: &[CalibrationPoint],
        axis: usize,
        cycle: usize,
    ) -> CalResult<f64> {
        let groups = self.temperature_groups(records, axis, cycle);
        if groups.is_empty() {
            return Err(CalError::InsufficientData("no linearity records".into()));
        }
        let mut worst: f64 = 0.0;
        for group in groups.values() {
            let outputs: Vec<f64> = group.iter().map(|r| r.output(axis)).collect();
            let inputs: Vec<f64> = group.iter().map(|r| r.input(self.spec.sensor_type)).collect();
            let fit = solve_least_squares(&outputs, &inputs, 1)?;
            worst = worst.max(nonlinearity(&outputs, &inputs, &fit.coefficients));
        }
        Ok(worst)
    }

    /// Largest |transverse output| over the axis/cycle records.
    pub fn cross_axis(&self, records: &[CalibrationPoint], axis: usize, cycle: usize) -> CalResult<f64> {
        let outputs: Vec<f64> = self
            .temperature_groups(records, axis, cycle)
            .values()
            .flatten()
            .map(|r| r.transverse_output(axis).abs())
            .collect();
        statistics::max(&outputs)
            .ok_or_else(|| CalError::InsufficientData("no cross-axis records".into()))
    }

    /// Digital reduction of one axis and cycle across all temperatures.
    ///
    /// With several temperatures: bias at 25 °C, BTS and accuracy. With one:
    /// the verification error instead. Linearity and cross-axis always.
    pub fn reduce_digital(
        &self,
        records: &[CalibrationPoint],
        unit: &UnitUnderTest,
        axis: usize,
        cycle: usize,
    ) -> ReductionMetrics {
        let mut out = ReductionMetrics::new(unit, axis, cycle, None);
        let limits = self.limits();
        let multi_temp = self.temperature_groups(records, axis, cycle).len() > 1;

        if multi_temp {
            match self.bias_over_temperature(records, axis, cycle) {
                Ok(bot) => {
                    out.push(Metric::checked(
                        MetricKind::Bias25C,
                        bot.bias_25c,
                        Some(Limit::MaxAbs { max: limits.bias }),
                    ));
                    out.push(Metric::checked(
                        MetricKind::BiasTempSensitivity,
                        bot.bts,
                        limits.bts_for(axis).map(|max| Limit::MaxAbs { max }),
                    ));
                    match self.accuracy(records, axis, cycle, bot.bias_25c) {
                        Ok(acc) => out.push(Metric::checked(
                            MetricKind::Accuracy,
                            acc,
                            limits.accuracy_for(axis).map(|max| Limit::MaxAbs { max }),
                        )),
                        Err(err) => out.fault("accuracy", &err),
                    }
                }
                Err(err) => out.fault("bias over temperature", &err),
            }
        } else {
            match self.verification_error(records, axis, cycle) {
                Ok(error) => out.push(Metric::checked(
                    MetricKind::VerificationError,
                    error,
                    limits.accuracy_for(axis).map(|max| Limit::MaxAbs { max }),
                )),
                Err(err) => out.fault("verification error", &err),
            }
        }

        match self.digital_linearity(records, axis, cycle) {
            Ok(nl) => out.push(Metric::checked(
                MetricKind::Nonlinearity,
                nl,
                limits.linearity_for(axis).map(|max| Limit::MaxAbs { max }),
            )),
            Err(err) => out.fault("linearity", &err),
        }
        match self.cross_axis(records, axis, cycle) {
            Ok(cross) => out.push(Metric::checked(
                MetricKind::CrossAxis,
                cross,
                limits.cross_axis_for(axis).map(|max| Limit::MaxAbs { max }),
            )),
            Err(err) => out.fault("cross axis", &err),
        }

        let polarity: Vec<&CalibrationPoint> = records
            .iter()
            .filter(|r| r.axis_index == axis && r.cycle_index == cycle && r.test == TestName::Polarity)
            .collect();
        if !polarity.is_empty() {
            match self.polarity(&polarity, axis) {
                Ok(metric) => out.push(metric),
                Err(err) => out.fault("polarity", &err),
            }
        }
        out
    }

    /// Tumble reduction: coefficients plus the worst deviation of the
    /// orthonormal matrix from identity.
    pub fn reduce_tumble(
        &self,
        unit: &UnitUnderTest,
        plus: &Matrix3<f64>,
        minus: &Matrix3<f64>,
    ) -> (ReductionMetrics, Option<TumbleCoefficients>) {
        let mut out = ReductionMetrics::new(unit, 0, 0, None);
        match tumble_coefficients(plus, minus, self.limits().nominal_adc) {
            Ok(coefficients) => {
                let deviation = (coefficients.orthonormal - Matrix3::identity())
                    .iter()
                    .fold(0.0_f64, |acc, v| acc.max(v.abs()));
                out.push(Metric::checked(
                    MetricKind::OrthonormalElement,
                    deviation,
                    Some(Limit::MaxAbs {
                        max: self.limits().orthonormal_element,
                    }),
                ));
                (out, Some(coefficients))
            }
            Err(err) => {
                out.fault("orthonormal matrix", &err);
                (out, None)
            }
        }
    }
}

fn pair(values: &[f64], what: &str) -> CalResult<(f64, f64)> {
    match values {
        [first, second] => Ok((*first, *second)),
        _ => Err(CalError::InsufficientData(format!(
            "{} pair needs 2 records, got {}",
            what,
            values.len()
        ))),
    }
}

fn no_scale_factor() -> CalError {
    CalError::InsufficientData("no scale factor for this axis".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::record::SensorSample;
    use crate::sensor::{BandwidthLimits, OutputType, Port, SensorType, TestEnables};

    fn spec(sensor_type: SensorType) -> SensorSpec {
        SensorSpec {
            part_no: "TEST".into(),
            model_no: String::new(),
            sensor_type,
            output_type: OutputType::AnalogVoltage,
            input_units: "g".into(),
            output_units: "V".into(),
            axes_no: 3,
            range: 1.0,
            linearity_points: 5,
            extra_points: 0,
            cycles: 1,
            cal_temps: vec![25.0],
            cal_temp_tol: vec![1.0],
            verify_temps: vec![],
            verify_temp_tol: vec![],
            soak_time_min: 0.0,
            settle_time_s: 0.0,
            limits: ToleranceLimits {
                linearity: vec![0.1],
                bias: 0.01,
                moa: 1.0,
                mpa: 1.0,
                input_axis: None,
                scale_factor: 2.0,
                scale_factor_tol: 0.25,
                fso: None,
                bts: vec![100.0],
                accuracy: vec![0.05],
                cross_axis: vec![0.05],
                bandwidth: None,
                orthonormal_element: 0.03,
                nominal_adc: 256_000.0,
            },
            tests: TestEnables::default(),
            mount: vec!["X".into(), "Y".into(), "Z".into()],
        }
    }

    fn unit() -> UnitUnderTest {
        UnitUnderTest::new("SN1", "TEST", Port(1))
    }

    fn record(test: TestName, temp: usize, angle: f64, x: f64, y: f64, plate: f64) -> CalibrationPoint {
        CalibrationPoint::new(
            "STAND-1",
            test,
            0,
            0,
            temp,
            angle,
            SensorSample {
                x,
                y,
                z: 0.0,
                unit_temp: plate,
                plate_temp: plate,
            },
        )
    }

    #[test]
    fn test_bias_and_output_axis_formulas() {
        assert_eq!(compute_bias(0.1, -0.1, 1.0), 0.0);
        let expected = (0.2_f64 / (2.0 * 9.81)).asin().to_degrees();
        assert_eq!(compute_output_axis(0.1, -0.1, 1.0, 9.81), expected);
        assert!((compute_pendulous_axis(-0.1, 0.1, 1.0, 9.81) - expected).abs() < 1e-15);
        assert_eq!(compute_input_axis_misalignment(3.0, 4.0), 5.0);
        assert_eq!(compute_full_scale(2.0, -2.0), 2.0);
    }

    #[test]
    fn test_nonlinearity_of_a_line_is_zero() {
        let x = [-1.0, -0.5, 0.0, 0.5, 1.0];
        let y: Vec<f64> = x.iter().map(|v| 2.5 * v - 0.3).collect();
        assert!(nonlinearity(&x, &y, &[-0.3, 2.5]).abs() < 1e-9);
    }

    #[test]
    fn test_nonlinearity_percent_of_range() {
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 1.5, 2.0];
        // Deviation 0.5 at x=1 over a range of 2.
        assert!((nonlinearity(&x, &y, &[0.0, 1.0]) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_reduce_analog_sweep_and_pairs() {
        let engine = ReductionEngine::new(spec(SensorType::Accelerometer), 9.81);
        let sf = 2.0;
        let mut records = vec![
            record(TestName::YTransverse, 0, -90.0, -sf, -0.01, 25.0),
            record(TestName::ZTransverse, 0, 0.0, 0.004, 0.0, 25.0),
        ];
        for angle in [90.0, 30.0, 0.0, -30.0, -90.0] {
            let input = f64::sin(f64::to_radians(angle));
            records.push(record(TestName::Linearity, 0, angle, sf * input + 0.002, 0.0, 25.0));
        }
        records.push(record(TestName::ZTransverse, 0, 180.0, 0.0, 0.0, 25.0));
        records.push(record(TestName::YTransverse, 0, 90.0, sf, 0.01, 25.0));

        let metrics = engine.reduce_analog(&records, &unit(), 0, 0, 0);
        assert!(metrics.faults.is_empty(), "{:?}", metrics.faults);
        assert!((metrics.scale_factor().unwrap() - 2.0).abs() < 1e-9);
        let intercept = metrics.get(MetricKind::Intercept).unwrap().value;
        assert!((intercept - 0.002).abs() < 1e-9);
        assert!(metrics.get(MetricKind::Nonlinearity).unwrap().value < 1e-6);
        let bias = metrics.get(MetricKind::Bias).unwrap();
        assert!((bias.value - 0.001).abs() < 1e-9);
        assert_eq!(bias.verdict, Verdict::Pass);
        let mya = metrics.get(MetricKind::PendulousAxisMisalignment).unwrap().value;
        let expected = (0.02_f64 / (2.0 * 9.81 * 2.0)).asin().to_degrees();
        assert!((mya - expected).abs() < 1e-9);
        assert!(metrics.get(MetricKind::InputAxisMisalignment).is_some());
        assert!(metrics.passed());
    }

    #[test]
    fn test_scale_factor_outside_window_fails() {
        let engine = ReductionEngine::new(spec(SensorType::Accelerometer), 9.81);
        let records: Vec<CalibrationPoint> = [-90.0, 0.0, 90.0]
            .iter()
            .map(|&a: &f64| record(TestName::Linearity, 0, a, 4.0 * a.to_radians().sin(), 0.0, 25.0))
            .collect();
        let metrics = engine.reduce_analog(&records, &unit(), 0, 0, 0);
        assert_eq!(metrics.get(MetricKind::ScaleFactor).unwrap().verdict, Verdict::Fail);
        assert!(!metrics.passed());
    }

    #[test]
    fn test_single_point_sweep_is_a_fault_not_a_zero() {
        let engine = ReductionEngine::new(spec(SensorType::Accelerometer), 9.81);
        let records = vec![
            record(TestName::Linearity, 0, 0.0, 0.0, 0.0, 25.0),
            record(TestName::ZTransverse, 0, 0.0, 0.0, 0.0, 25.0),
            record(TestName::ZTransverse, 0, 180.0, 0.0, 0.0, 25.0),
        ];
        let metrics = engine.reduce_analog(&records, &unit(), 0, 0, 0);
        assert!(metrics.scale_factor().is_none());
        assert_eq!(metrics.faults.len(), 2);
    }

    #[test]
    fn test_bias_over_temperature() {
        let engine = ReductionEngine::new(spec(SensorType::Inclinometer), 9.81);
        let mut records = Vec::new();
        // Bias drifts linearly: 0.001 deg/°C around 25 °C.
        for (index, plate) in [-40.0, 25.0, 85.0].into_iter().enumerate() {
            let bias = 0.001 * (plate - 25.0);
            for angle in [-10.0, 0.0, 10.0] {
                records.push(record(TestName::ThermalCalibration, index, angle, angle + bias, 0.0, plate));
            }
        }
        let bot = engine.bias_over_temperature(&records, 0, 0).unwrap();
        assert!(bot.bias_25c.abs() < 1e-9);
        assert!((bot.bts - 1000.0).abs() < 1e-6);

        let metrics = engine.reduce_digital(&records, &unit(), 0, 0);
        let acc = metrics.get(MetricKind::Accuracy).unwrap();
        assert!((acc.value - 0.065).abs() < 1e-9);
        assert_eq!(acc.verdict, Verdict::Fail);
        assert!(metrics.get(MetricKind::Nonlinearity).unwrap().value < 1e-6);
    }

    #[test]
    fn test_single_temperature_reports_verification_error() {
        let engine = ReductionEngine::new(spec(SensorType::Inclinometer), 9.81);
        let records: Vec<CalibrationPoint> = [-10.0, 0.0, 10.0]
            .iter()
            .map(|&a| record(TestName::ThermalCalibration, 0, a, a - 0.02, 0.03, 25.0))
            .collect();
        assert!(matches!(
            engine.bias_over_temperature(&records, 0, 0),
            Err(CalError::InsufficientData(_))
        ));
        let metrics = engine.reduce_digital(&records, &unit(), 0, 0);
        let err = metrics.get(MetricKind::VerificationError).unwrap();
        assert!((err.value - 0.02).abs() < 1e-9);
        assert!((metrics.get(MetricKind::CrossAxis).unwrap().value - 0.03).abs() < 1e-12);
        assert!(metrics.faults.is_empty());
    }

    #[test]
    fn test_reversed_polarity_and_bandwidth() {
        let mut spec = spec(SensorType::Inclinometer);
        spec.limits.bandwidth = Some(BandwidthLimits { low: 40.0, high: 60.0 });
        let engine = ReductionEngine::new(spec, 9.81);
        let records = vec![
            record(TestName::Polarity, 0, 0.0, 0.5, 0.0, 25.0),
            record(TestName::Polarity, 0, 10.0, 0.3, 0.0, 25.0),
            record(TestName::Bandwidth, 0, 72.0, 0.0, 0.0, 0.0),
        ];
        let metrics = engine.reduce_analog(&records, &unit(), 0, 0, 0);
        let polarity = metrics.get(MetricKind::Polarity).unwrap();
        assert_eq!(polarity.value, -1.0);
        assert_eq!(polarity.verdict, Verdict::Fail);
        let bandwidth = metrics.get(MetricKind::Bandwidth).unwrap();
        assert_eq!(bandwidth.value, 72.0);
        assert_eq!(bandwidth.verdict, Verdict::Fail);
    }

    #[test]
    fn test_tumble_identity() {
        let counts = 256_000.0;
        let offset = Vector3::new(30.0, -60.0, 90.0);
        let plus = Matrix3::from_diagonal_element(counts) + Matrix3::from_diagonal(&offset);
        let minus = Matrix3::from_diagonal_element(-counts) + Matrix3::from_diagonal(&offset);
        let coefficients = tumble_coefficients(&plus, &minus, counts).unwrap();
        assert!((coefficients.orthonormal - Matrix3::identity()).norm() < 1e-12);
        assert!((coefficients.offset - offset * 2.0 / 3.0).norm() < 1e-9);

        let engine = ReductionEngine::new(spec(SensorType::Inclinometer), 9.81);
        let (metrics, coefficients) = engine.reduce_tumble(&unit(), &plus, &minus);
        assert!(coefficients.is_some());
        assert!(metrics.passed());
    }

    #[test]
    fn test_tumble_singular() {
        let engine = ReductionEngine::new(spec(SensorType::Inclinometer), 9.81);
        let same = Matrix3::identity();
        let (metrics, coefficients) = engine.reduce_tumble(&unit(), &same, &same);
        assert!(coefficients.is_none());
        assert_eq!(metrics.faults.len(), 1);
    }

    #[test]
    fn test_tumble_matrices_from_records() {
        let tumble = |axis: usize, angle: f64, counts: [f64; 3]| {
            let mut point = record(TestName::Tumble, 0, angle, counts[0], counts[1], 25.0);
            point.axis_index = axis;
            point.z_output = counts[2];
            point
        };
        let mut records = vec![
            tumble(0, 90.0, [1000.0, 0.0, 0.0]),
            tumble(0, -90.0, [-1000.0, 0.0, 0.0]),
            tumble(1, 90.0, [0.0, 1000.0, 0.0]),
            tumble(1, -90.0, [0.0, -1000.0, 0.0]),
            tumble(1, 180.0, [0.0, 0.0, -1000.0]),
        ];
        assert!(matches!(
            tumble_matrices(&records),
            Err(CalError::InsufficientData(_))
        ));
        records.push(tumble(1, 0.0, [0.0, 0.0, 1000.0]));
        let (plus, minus) = tumble_matrices(&records).unwrap();
        assert_eq!(plus, Matrix3::from_diagonal_element(1000.0));
        assert_eq!(minus, Matrix3::from_diagonal_element(-1000.0));
    }
}
