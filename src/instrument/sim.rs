//! Simulated test stand.
//!
//! All simulated instruments share one [`SimWorld`] holding the stage angle,
//! the chamber temperature and the orientation the units are mounted in, so a
//! stage move is immediately visible in the next scan. Sensor outputs come
//! from a deterministic [`SensorModel`] per port.
//!
//! Used by `mems-cal run --simulate` and by the integration tests.

use super::{
    AmbientTemperatures, ChannelRange, DigitalReading, MotionDevice, PositionReading, PowerDevice,
    ScanDevice, ScanFunction, SensorBus, ThermalDevice, Thermometer, TumbleCoefficients,
};
use crate::config::PortChannels;
use crate::error::{CalError, CalResult};
use crate::sensor::{Port, SensorType};
use async_trait::async_trait;
use nalgebra::Vector3;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// World state
// ============================================================================

#[derive(Debug)]
struct WorldState {
    angle: f64,
    mounted_axis: usize,
    chamber_setpoint: f64,
    chamber_temp: f64,
}

/// Physical state shared by every simulated instrument.
#[derive(Debug)]
pub struct SimWorld {
    state: Mutex<WorldState>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new(25.0)
    }
}

impl SimWorld {
    pub fn new(ambient: f64) -> Self {
        Self {
            state: Mutex::new(WorldState {
                angle: 0.0,
                mounted_axis: 0,
                chamber_setpoint: ambient,
                chamber_temp: ambient,
            }),
        }
    }

    pub fn angle(&self) -> f64 {
        lock(&self.state).angle
    }

    pub fn set_angle(&self, angle: f64) {
        lock(&self.state).angle = angle;
    }

    pub fn mounted_axis(&self) -> usize {
        lock(&self.state).mounted_axis
    }

    /// Operator remounted the units with `axis` sensitive to the stage tilt.
    pub fn set_mounted_axis(&self, axis: usize) {
        lock(&self.state).mounted_axis = axis;
    }

    pub fn chamber_temp(&self) -> f64 {
        lock(&self.state).chamber_temp
    }

    /// Gravity vector in the sensor frame, in g.
    fn gravity(&self) -> Vector3<f64> {
        let state = lock(&self.state);
        let theta = state.angle.to_radians();
        let mut g = Vector3::zeros();
        let (tilt_axis, level_axis) = match state.mounted_axis {
            0 => (0, 2),
            1 => (1, 2),
            _ => (2, 0),
        };
        g[tilt_axis] = theta.sin();
        g[level_axis] = theta.cos();
        g
    }
}

// ============================================================================
// Sensor model
// ============================================================================

/// Deterministic response of one simulated unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorModel {
    pub sensor_type: SensorType,
    /// Output units per input unit on the sensitive axis.
    pub scale_factor: f64,
    pub bias: f64,
    /// Second-order term, output units per input unit squared.
    pub quadratic: f64,
    /// Fraction of the sensitive-axis response leaking into the other axes.
    pub cross_coupling: f64,
    pub cross_bias: f64,
    /// Bias drift, output units per °C away from 25 °C.
    pub temp_coefficient: f64,
    /// `-1.0` simulates a unit wired backwards.
    pub polarity: f64,
}

impl SensorModel {
    pub fn linear(sensor_type: SensorType, scale_factor: f64, bias: f64) -> Self {
        Self {
            sensor_type,
            scale_factor,
            bias,
            quadratic: 0.0,
            cross_coupling: 0.0,
            cross_bias: 0.0,
            temp_coefficient: 0.0,
            polarity: 1.0,
        }
    }

    fn input(&self, angle: f64) -> f64 {
        crate::analysis::conversion::stage_angle_to_input(angle, self.sensor_type)
    }

    /// Sensitive-axis output at `angle` and `temp`.
    pub fn primary(&self, angle: f64, temp: f64) -> f64 {
        let a = self.input(angle);
        self.polarity * (self.scale_factor * a + self.quadratic * a * a)
            + self.bias
            + self.temp_coefficient * (temp - 25.0)
    }

    /// Output of a non-sensitive axis at `angle`.
    pub fn cross(&self, angle: f64) -> f64 {
        self.cross_bias + self.cross_coupling * self.scale_factor * self.input(angle)
    }

    fn axis_outputs(&self, angle: f64, temp: f64, mounted_axis: usize) -> [f64; 3] {
        let mut out = [self.cross(angle); 3];
        out[mounted_axis.min(2)] = self.primary(angle, temp);
        out
    }
}

// ============================================================================
// Stage
// ============================================================================

/// Stage that arrives instantly unless told to stick.
pub struct SimStage {
    world: Arc<SimWorld>,
    stuck: AtomicBool,
    should_fail_next: AtomicBool,
    call_log: Mutex<Vec<String>>,
}

impl SimStage {
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self {
            world,
            stuck: AtomicBool::new(false),
            should_fail_next: AtomicBool::new(false),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// A stuck stage accepts moves but never leaves its position.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    fn record(&self, call: String) -> CalResult<()> {
        lock(&self.call_log).push(call);
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(CalError::transport("sim-stage", "Injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl MotionDevice for SimStage {
    fn id(&self) -> &str {
        "sim-stage"
    }

    async fn move_absolute(&self, angle: f64, _speed: f64) -> CalResult<()> {
        self.record(format!("move_absolute {}", angle))?;
        if !self.stuck.load(Ordering::SeqCst) {
            self.world.set_angle(angle);
        }
        Ok(())
    }

    async fn move_incremental(&self, delta: f64, _speed: f64) -> CalResult<()> {
        self.record(format!("move_incremental {}", delta))?;
        if !self.stuck.load(Ordering::SeqCst) {
            self.world.set_angle(self.world.angle() + delta);
        }
        Ok(())
    }

    async fn read_position(&self) -> CalResult<PositionReading> {
        Ok(PositionReading::Single(self.world.angle()))
    }

    async fn home(&self) -> CalResult<()> {
        self.record("home".to_string())?;
        if !self.stuck.load(Ordering::SeqCst) {
            self.world.set_angle(0.0);
        }
        Ok(())
    }
}

// ============================================================================
// Chamber
// ============================================================================

/// Chamber that reaches its setpoint as soon as it is written.
pub struct SimChamber {
    world: Arc<SimWorld>,
    sluggish: AtomicBool,
    setpoint_writes: AtomicUsize,
}

impl SimChamber {
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self {
            world,
            sluggish: AtomicBool::new(false),
            setpoint_writes: AtomicUsize::new(0),
        }
    }

    /// Number of `set_setpoint` calls so far.
    pub fn setpoint_writes(&self) -> usize {
        self.setpoint_writes.load(Ordering::SeqCst)
    }

    /// A sluggish chamber accepts setpoints but never changes temperature.
    pub fn set_sluggish(&self, sluggish: bool) {
        self.sluggish.store(sluggish, Ordering::SeqCst);
    }
}

#[async_trait]
impl ThermalDevice for SimChamber {
    fn id(&self) -> &str {
        "sim-chamber"
    }

    async fn set_setpoint(&self, temp: f64) -> CalResult<()> {
        self.setpoint_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.world.state);
        state.chamber_setpoint = temp;
        if !self.sluggish.load(Ordering::SeqCst) {
            state.chamber_temp = temp;
        }
        Ok(())
    }

    async fn read_setpoint(&self) -> CalResult<f64> {
        Ok(lock(&self.world.state).chamber_setpoint)
    }

    async fn read_process_value(&self) -> CalResult<f64> {
        Ok(self.world.chamber_temp())
    }
}

// ============================================================================
// Scanner + thermometry
// ============================================================================

#[derive(Debug, Default)]
struct ScanSetup {
    channels: Option<ChannelRange>,
    cycles: u32,
    buffer: Vec<f64>,
}

/// Scanner producing sensor outputs from [`SensorModel`]s and fixed values
/// for board-level channels.
pub struct SimDaq {
    world: Arc<SimWorld>,
    units: BTreeMap<Port, SensorModel>,
    port_map: BTreeMap<Port, PortChannels>,
    channel_values: BTreeMap<u32, f64>,
    empty_reads: AtomicU32,
    malformed_reads: AtomicU32,
    truncate_next_scan: AtomicBool,
    setup: Mutex<ScanSetup>,
}

impl SimDaq {
    pub fn new(
        world: Arc<SimWorld>,
        units: BTreeMap<Port, SensorModel>,
        port_map: BTreeMap<Port, PortChannels>,
    ) -> Self {
        Self {
            world,
            units,
            port_map,
            channel_values: BTreeMap::new(),
            empty_reads: AtomicU32::new(0),
            malformed_reads: AtomicU32::new(0),
            truncate_next_scan: AtomicBool::new(false),
            setup: Mutex::new(ScanSetup::default()),
        }
    }

    /// Fixed reading for a board-level channel (rails, resistors).
    pub fn with_channel_value(mut self, channel: u32, value: f64) -> Self {
        self.channel_values.insert(channel, value);
        self
    }

    /// The next `count` sensor reads come back empty.
    pub fn fail_reads_empty(&self, count: u32) {
        self.empty_reads.store(count, Ordering::SeqCst);
    }

    /// The next `count` sensor reads contain a non-numeric token.
    pub fn fail_reads_malformed(&self, count: u32) {
        self.malformed_reads.store(count, Ordering::SeqCst);
    }

    /// The next buffered scan loses its last reading.
    pub fn truncate_next_scan(&self) {
        self.truncate_next_scan.store(true, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ScanDevice for SimDaq {
    fn id(&self) -> &str {
        "sim-daq"
    }

    async fn configure(&self, function: ScanFunction, channels: ChannelRange) -> CalResult<()> {
        debug!("sim-daq sensing {} on {}", function, channels);
        lock(&self.setup).channels = Some(channels);
        Ok(())
    }

    async fn set_scan(&self, channels: ChannelRange, _delay: Duration, cycles: u32) -> CalResult<()> {
        let mut setup = lock(&self.setup);
        setup.channels = Some(channels);
        setup.cycles = cycles;
        Ok(())
    }

    async fn trigger(&self) -> CalResult<()> {
        let mut setup = lock(&self.setup);
        let channels = setup
            .channels
            .ok_or_else(|| CalError::Instrument("sim-daq triggered before configure".into()))?;
        let mut buffer = Vec::with_capacity(channels.len() * setup.cycles as usize);
        for cycle in 0..setup.cycles {
            for ch in channels.start..=channels.end {
                let base = self.channel_values.get(&ch).copied().unwrap_or(0.0);
                // Small alternating ripple so averaging is observable.
                let ripple = if cycle % 2 == 0 { 1e-4 } else { -1e-4 };
                buffer.push(base + ripple);
            }
        }
        if setup.cycles % 2 == 1 {
            // Cancel the unpaired ripple of an odd cycle count.
            let n = channels.len();
            let last_cycle = buffer.len().saturating_sub(n);
            for v in &mut buffer[last_cycle..] {
                *v -= 1e-4;
            }
        }
        if self.truncate_next_scan.swap(false, Ordering::SeqCst) {
            buffer.pop();
        }
        setup.buffer = buffer;
        Ok(())
    }

    async fn wait_complete(&self) -> CalResult<()> {
        Ok(())
    }

    async fn buffer_extent(&self) -> CalResult<(u32, u32)> {
        let len = lock(&self.setup).buffer.len() as u32;
        Ok((1, len))
    }

    async fn read_buffer(&self, start: u32, end: u32) -> CalResult<String> {
        let setup = lock(&self.setup);
        let from = start.saturating_sub(1) as usize;
        let to = (end as usize).min(setup.buffer.len());
        let values: Vec<String> = setup.buffer[from.min(to)..to]
            .iter()
            .map(f64::to_string)
            .collect();
        Ok(values.join(","))
    }

    async fn clear_buffer(&self) -> CalResult<()> {
        lock(&self.setup).buffer.clear();
        Ok(())
    }

    async fn open_all(&self) -> CalResult<()> {
        Ok(())
    }

    async fn read_channels(&self) -> CalResult<String> {
        if Self::take_one(&self.empty_reads) {
            return Ok(String::new());
        }
        let angle = self.world.angle();
        let temp = self.world.chamber_temp();
        let mounted = self.world.mounted_axis();
        let mut tokens = Vec::new();
        for (port, model) in &self.units {
            let Some(channels) = self.port_map.get(port) else {
                continue;
            };
            let out = model.axis_outputs(angle, temp, mounted);
            for (value, label) in [(out[0], &channels.x), (out[1], &channels.y), (temp, &channels.t)] {
                tokens.push(value.to_string());
                tokens.push(label.clone());
            }
        }
        if Self::take_one(&self.malformed_reads) && !tokens.is_empty() {
            tokens[0] = "OVERFLOW".to_string();
        }
        Ok(tokens.join(","))
    }
}

#[async_trait]
impl Thermometer for SimDaq {
    fn id(&self) -> &str {
        "sim-daq"
    }

    async fn read_temperatures(&self) -> CalResult<AmbientTemperatures> {
        let temp = self.world.chamber_temp();
        Ok(AmbientTemperatures {
            plate: temp,
            pillar: temp + 0.5,
        })
    }
}

// ============================================================================
// Supply
// ============================================================================

#[derive(Default)]
pub struct SimSupply {
    call_log: Mutex<Vec<String>>,
}

impl SimSupply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }
}

#[async_trait]
impl PowerDevice for SimSupply {
    fn id(&self) -> &str {
        "sim-supply"
    }

    async fn apply(&self, channel: u8, volts: f64, amps: f64) -> CalResult<()> {
        lock(&self.call_log).push(format!("apply CH{} {} {}", channel, volts, amps));
        Ok(())
    }

    async fn set_output(&self, channel: u8, enabled: bool) -> CalResult<()> {
        lock(&self.call_log).push(format!("output CH{} {}", channel, enabled));
        Ok(())
    }
}

// ============================================================================
// Digital sensor bus
// ============================================================================

/// Digital units answering from [`SensorModel`]s. In tumble mode they report
/// raw ADC counts of the gravity vector instead.
pub struct SimSensorBus {
    world: Arc<SimWorld>,
    units: BTreeMap<Port, SensorModel>,
    counts_per_g: f64,
    raw_offset: Vector3<f64>,
    tumble_mode: Mutex<HashSet<Port>>,
    loaded: Mutex<Vec<String>>,
}

impl SimSensorBus {
    pub fn new(world: Arc<SimWorld>, units: BTreeMap<Port, SensorModel>, counts_per_g: f64) -> Self {
        Self {
            world,
            units,
            counts_per_g,
            raw_offset: Vector3::zeros(),
            tumble_mode: Mutex::new(HashSet::new()),
            loaded: Mutex::new(Vec::new()),
        }
    }

    pub fn with_raw_offset(mut self, offset: Vector3<f64>) -> Self {
        self.raw_offset = offset;
        self
    }

    /// Log of everything loaded into the sensors.
    pub fn loaded(&self) -> Vec<String> {
        lock(&self.loaded).clone()
    }

    fn model(&self, port: Port) -> CalResult<&SensorModel> {
        self.units
            .get(&port)
            .ok_or_else(|| CalError::transport(port.to_string(), "no sensor on port"))
    }
}

#[async_trait]
impl SensorBus for SimSensorBus {
    fn id(&self) -> &str {
        "sim-bus"
    }

    async fn configure(&self, port: Port, tumble: bool) -> CalResult<()> {
        self.model(port)?;
        let mut modes = lock(&self.tumble_mode);
        if tumble {
            modes.insert(port);
        } else {
            modes.remove(&port);
        }
        Ok(())
    }

    async fn read_outputs(&self, port: Port) -> CalResult<DigitalReading> {
        let model = self.model(port)?;
        let temp = self.world.chamber_temp();
        if lock(&self.tumble_mode).contains(&port) {
            let raw = self.world.gravity() * self.counts_per_g + self.raw_offset;
            return Ok(DigitalReading {
                x: raw[0],
                y: raw[1],
                z: raw[2],
                temperature: temp,
            });
        }
        let out = model.axis_outputs(self.world.angle(), temp, self.world.mounted_axis());
        Ok(DigitalReading {
            x: out[0],
            y: out[1],
            z: out[2],
            temperature: temp,
        })
    }

    async fn load_lookup_table(&self, port: Port, data_file: &Path) -> CalResult<()> {
        lock(&self.loaded).push(format!("lut {} {}", port, data_file.display()));
        Ok(())
    }

    async fn load_tumble_coefficients(
        &self,
        port: Port,
        coefficients: &TumbleCoefficients,
    ) -> CalResult<()> {
        lock(&self.loaded).push(format!(
            "tumble {} offset [{:.1}, {:.1}, {:.1}]",
            port, coefficients.offset[0], coefficients.offset[1], coefficients.offset[2]
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_map() -> BTreeMap<Port, PortChannels> {
        crate::config::default_port_map()
    }

    #[tokio::test]
    async fn test_stage_moves_world() {
        let world = Arc::new(SimWorld::default());
        let stage = SimStage::new(world.clone());
        stage.move_absolute(30.0, 25.0).await.unwrap();
        stage.move_incremental(5.0, 25.0).await.unwrap();
        assert_eq!(world.angle(), 35.0);
        stage.set_stuck(true);
        stage.move_absolute(-10.0, 25.0).await.unwrap();
        assert_eq!(stage.read_position().await.unwrap(), PositionReading::Single(35.0));
    }

    #[tokio::test]
    async fn test_sensor_reads_follow_stage() {
        let world = Arc::new(SimWorld::default());
        let model = SensorModel::linear(SensorType::Accelerometer, 2.0, 0.1);
        let daq = SimDaq::new(world.clone(), BTreeMap::from([(Port(1), model)]), port_map());
        world.set_angle(90.0);
        let raw = daq.read_channels().await.unwrap();
        let tokens: Vec<&str> = raw.split(',').collect();
        assert_eq!(tokens[1], "101");
        assert!((tokens[0].parse::<f64>().unwrap() - 2.1).abs() < 1e-12);
        assert_eq!(tokens[3], "102");
        assert_eq!(tokens[5], "103");
    }

    #[tokio::test]
    async fn test_buffered_scan_is_cycle_major() {
        let world = Arc::new(SimWorld::default());
        let daq = SimDaq::new(world, BTreeMap::new(), port_map())
            .with_channel_value(101, 5.0)
            .with_channel_value(102, 3.3);
        let range = ChannelRange::new(101, 102).unwrap();
        daq.set_scan(range, Duration::ZERO, 2).await.unwrap();
        daq.trigger().await.unwrap();
        let (start, end) = daq.buffer_extent().await.unwrap();
        assert_eq!((start, end), (1, 4));
        let values: Vec<f64> = daq
            .read_buffer(start, end)
            .await
            .unwrap()
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        assert!((values[0] - 5.0001).abs() < 1e-12);
        assert!((values[3] - 3.2999).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_tumble_mode_reports_gravity_counts() {
        let world = Arc::new(SimWorld::default());
        let model = SensorModel::linear(SensorType::Inclinometer, 1.0, 0.0);
        let bus = SimSensorBus::new(world.clone(), BTreeMap::from([(Port(1), model)]), 1000.0);
        bus.configure(Port(1), true).await.unwrap();
        world.set_angle(90.0);
        let reading = bus.read_outputs(Port(1)).await.unwrap();
        assert!((reading.x - 1000.0).abs() < 1e-9);
        assert!(reading.z.abs() < 1e-9);
        assert!(bus.read_outputs(Port(2)).await.is_err());
    }
}
