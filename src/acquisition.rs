//! Multi-channel scan acquisition.
//!
//! [`ChannelScanner`] owns the scan device and the thermometry path. It runs
//! buffered scans (board checks, noise), averages them per channel, and reads
//! the per-port X/Y/T triplets the calibration routines sample at every point.

use crate::analysis::statistics;
use crate::config::{DaqConfig, PortChannels};
use crate::error::{CalError, CalResult, Outcome};
use crate::instrument::{AmbientTemperatures, ChannelRange, ScanDevice, ScanFunction, Thermometer};
use crate::sensor::{OutputType, Port};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// How the sensor outputs are sensed on the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseMode {
    Voltage,
    /// Current-output parts read across a shunt; readings are scaled ×10.
    Current,
}

impl SenseMode {
    pub fn scalar(self) -> f64 {
        match self {
            SenseMode::Voltage => 1.0,
            SenseMode::Current => 10.0,
        }
    }
}

impl From<OutputType> for SenseMode {
    fn from(output: OutputType) -> Self {
        match output {
            OutputType::AnalogCurrent => SenseMode::Current,
            OutputType::AnalogVoltage | OutputType::Digital => SenseMode::Voltage,
        }
    }
}

/// One port's averaged sensor channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortReading {
    pub x: f64,
    pub y: f64,
    /// Unit temperature channel.
    pub t: f64,
}

/// Result of one sensor read: per-port readings plus ambient temperatures.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub ports: BTreeMap<Port, PortReading>,
    pub ambient: AmbientTemperatures,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Averages a cycle-major trace into one value per channel index.
///
/// The trace holds all channels of cycle 0, then all channels of cycle 1, and
/// so on; channel `i` of cycle `c` sits at `i + c * channel_count`.
///
/// # Errors
/// `MalformedScan` if `raw.len() != channel_count * cycles`.
pub fn average_by_channel(
    raw: &[f64],
    channel_count: usize,
    cycles: usize,
) -> CalResult<BTreeMap<usize, f64>> {
    if channel_count == 0 || cycles == 0 || raw.len() != channel_count * cycles {
        return Err(CalError::MalformedScan(format!(
            "expected {} channels x {} cycles = {} readings, got {}",
            channel_count,
            cycles,
            channel_count * cycles,
            raw.len()
        )));
    }
    let mut averages = BTreeMap::new();
    for channel in 0..channel_count {
        let values: Vec<f64> = (0..cycles).map(|c| raw[channel + c * channel_count]).collect();
        let mean = statistics::mean(&values).unwrap_or(f64::NAN);
        averages.insert(channel, mean);
    }
    Ok(averages)
}

/// Parses a comma-separated float buffer.
pub fn parse_buffer(raw: &str) -> CalResult<Vec<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|tok| {
            let tok = tok.trim();
            tok.parse::<f64>()
                .map_err(|_| CalError::MalformedScan(format!("non-numeric token '{}'", tok)))
        })
        .collect()
}

/// Parses alternating `reading,channel` pairs into a channel → reading map.
pub fn parse_channel_pairs(raw: &str) -> CalResult<HashMap<String, f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    let tokens: Vec<&str> = raw.split(',').map(str::trim).collect();
    if tokens.len() % 2 != 0 {
        return Err(CalError::MalformedScan(format!(
            "odd token count {} in reading/channel pairs",
            tokens.len()
        )));
    }
    tokens
        .chunks(2)
        .map(|pair| {
            let value = pair[0].parse::<f64>().map_err(|_| {
                CalError::MalformedScan(format!("non-numeric reading '{}'", pair[0]))
            })?;
            Ok((pair[1].to_string(), value))
        })
        .collect()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Drives scans on one acquisition instrument.
pub struct ChannelScanner {
    device: Arc<dyn ScanDevice>,
    thermometer: Arc<dyn Thermometer>,
    config: DaqConfig,
}

impl ChannelScanner {
    pub fn new(device: Arc<dyn ScanDevice>, thermometer: Arc<dyn Thermometer>, config: DaqConfig) -> Self {
        Self {
            device,
            thermometer,
            config,
        }
    }

    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    pub fn port_channels(&self, port: Port) -> Option<&PortChannels> {
        self.config.port_map.get(&port)
    }

    fn settle_per_cycle(&self, function: ScanFunction) -> Duration {
        let secs = match function {
            ScanFunction::Resistance => self.config.resistance_secs_per_cycle,
            ScanFunction::Voltage | ScanFunction::AcVoltage => self.config.voltage_secs_per_cycle,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Runs a buffered scan of `cycles` repetitions over `channels`.
    ///
    /// Blocks for the instrument settle time (proportional to `cycles`), then
    /// reads the whole buffer back and opens all relays.
    ///
    /// # Errors
    /// - Transport faults from the device
    /// - `MalformedScan` for non-numeric buffer contents
    pub async fn scan(
        &self,
        function: ScanFunction,
        channels: ChannelRange,
        cycles: u32,
    ) -> CalResult<Vec<f64>> {
        info!(
            "Scanning {} on {} for {} cycle(s) using '{}'",
            function,
            channels,
            cycles,
            self.device.id()
        );
        self.device.clear_buffer().await?;
        self.device.configure(function, channels).await?;
        self.device
            .set_scan(channels, self.config.inter_channel_delay(), cycles)
            .await?;
        self.device.trigger().await?;
        self.device.wait_complete().await?;
        sleep(self.settle_per_cycle(function) * cycles).await;
        self.device.open_all().await?;

        let (start, end) = self.device.buffer_extent().await?;
        if end < start {
            return Ok(Vec::new());
        }
        let raw = self.device.read_buffer(start, end).await?;
        parse_buffer(&raw)
    }

    /// [`scan`](Self::scan) followed by [`average_by_channel`].
    pub async fn scan_averaged(
        &self,
        function: ScanFunction,
        channels: ChannelRange,
        cycles: u32,
    ) -> CalResult<BTreeMap<usize, f64>> {
        let raw = self.scan(function, channels, cycles).await?;
        average_by_channel(&raw, channels.len(), cycles as usize)
    }

    /// Buffered scan over the channels wired to `ports`, averaged and mapped
    /// back to each port's X/Y/T triplet. Used for AC (noise) readings.
    ///
    /// # Errors
    /// - `Configuration` if a port has no mapping or a non-numeric channel
    /// - Transport faults and `MalformedScan` from [`scan`](Self::scan)
    pub async fn scan_ports(
        &self,
        function: ScanFunction,
        ports: &[Port],
        cycles: u32,
    ) -> CalResult<BTreeMap<Port, PortReading>> {
        let mut wiring = Vec::with_capacity(ports.len());
        for &port in ports {
            let map = self.config.port_map.get(&port).ok_or_else(|| {
                CalError::Configuration(format!("{} has no channel mapping", port))
            })?;
            let channel = |label: &str| {
                label.parse::<u32>().map_err(|_| {
                    CalError::Configuration(format!("{}: channel '{}' is not numeric", port, label))
                })
            };
            wiring.push((port, channel(&map.x)?, channel(&map.y)?, channel(&map.t)?));
        }
        let (Some(start), Some(end)) = (
            wiring.iter().map(|w| w.1.min(w.2).min(w.3)).min(),
            wiring.iter().map(|w| w.1.max(w.2).max(w.3)).max(),
        ) else {
            return Ok(BTreeMap::new());
        };
        let range = ChannelRange::new(start, end)?;
        let averages = self.scan_averaged(function, range, cycles).await?;
        let value = |channel: u32| {
            averages
                .get(&((channel - start) as usize))
                .copied()
                .ok_or_else(|| CalError::MalformedScan(format!("channel {} missing from scan", channel)))
        };
        wiring
            .into_iter()
            .map(|(port, x, y, t)| {
                Ok((
                    port,
                    PortReading {
                        x: round_to(value(x)?, 6),
                        y: round_to(value(y)?, 6),
                        t: round_to(value(t)?, 3),
                    },
                ))
            })
            .collect()
    }

    /// Plate and pillar temperatures. A failed read yields the `-999` sentinel.
    pub async fn ambient_temperatures(&self) -> AmbientTemperatures {
        match self.thermometer.read_temperatures().await {
            Ok(temps) => temps,
            Err(err) => {
                warn!("Thermometry read failed on '{}': {}", self.thermometer.id(), err);
                AmbientTemperatures::unavailable()
            }
        }
    }

    pub async fn plate_temperature(&self) -> f64 {
        self.ambient_temperatures().await.plate
    }

    /// Reads every requested port once.
    ///
    /// Polls the device until a non-empty, well-formed read arrives or the
    /// configured timeout passes. Malformed reads are logged and discarded.
    /// X and Y are scaled for `mode` and rounded to 6 decimals, T to 3.
    ///
    /// # Returns
    /// - `Success` with one entry per port that had all three channels
    /// - `Degraded` with an empty result when the timeout passed
    ///
    /// # Errors
    /// - Transport faults from the device
    pub async fn read_data_from_scan(
        &self,
        mode: SenseMode,
        ports: &[Port],
    ) -> CalResult<Outcome<ScanResult>> {
        let deadline = Instant::now() + self.config.timeout();
        let channels = loop {
            match parse_channel_pairs(&self.device.read_channels().await?) {
                Ok(channels) if !channels.is_empty() => break Some(channels),
                Ok(_) => debug!("Empty read from '{}'", self.device.id()),
                Err(err) => warn!("Discarding read from '{}': {}", self.device.id(), err),
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(self.config.poll_interval()).await;
        };
        let ambient = self.ambient_temperatures().await;

        let Some(channels) = channels else {
            warn!(
                "No data from '{}' after {:?}",
                self.device.id(),
                self.config.timeout()
            );
            return Ok(Outcome::degraded(
                ScanResult {
                    ports: BTreeMap::new(),
                    ambient,
                },
                "scan returned no data before the timeout",
            ));
        };

        let scalar = mode.scalar();
        let mut readings = BTreeMap::new();
        for &port in ports {
            let Some(map) = self.config.port_map.get(&port) else {
                warn!("{} has no channel mapping", port);
                continue;
            };
            match (channels.get(&map.x), channels.get(&map.y), channels.get(&map.t)) {
                (Some(x), Some(y), Some(t)) => {
                    readings.insert(
                        port,
                        PortReading {
                            x: round_to(x * scalar, 6),
                            y: round_to(y * scalar, 6),
                            t: round_to(*t, 3),
                        },
                    );
                }
                _ => warn!("{} missing channels in scan result", port),
            }
        }
        Ok(Outcome::Success(ScanResult {
            ports: readings,
            ambient,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_port_map;
    use crate::instrument::sim::{SensorModel, SimDaq, SimWorld};
    use crate::sensor::SensorType;

    fn fast_config() -> DaqConfig {
        DaqConfig {
            timeout_s: 0.05,
            poll_interval_ms: 1,
            voltage_secs_per_cycle: 0.0,
            resistance_secs_per_cycle: 0.0,
            inter_channel_delay_s: 0.0,
            ..DaqConfig::default()
        }
    }

    fn scanner(daq: Arc<SimDaq>) -> ChannelScanner {
        ChannelScanner::new(daq.clone(), daq, fast_config())
    }

    #[test]
    fn test_average_by_channel_exact() {
        // 3 channels x 5 cycles, cycle-major.
        let mut raw = Vec::new();
        for cycle in 0..5 {
            for channel in 0..3 {
                raw.push((channel * 10 + cycle) as f64);
            }
        }
        let averages = average_by_channel(&raw, 3, 5).unwrap();
        assert_eq!(averages[&0], 2.0);
        assert_eq!(averages[&1], 12.0);
        assert_eq!(averages[&2], 22.0);
    }

    #[test]
    fn test_average_rejects_truncated_buffer() {
        let raw = vec![1.0; 14];
        assert!(matches!(
            average_by_channel(&raw, 3, 5),
            Err(CalError::MalformedScan(_))
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_buffer("1.5, -2e-3,3").unwrap(), vec![1.5, -0.002, 3.0]);
        assert!(parse_buffer("1.0,abc").is_err());
        let pairs = parse_channel_pairs("+1.25E-01,101,2.0,102").unwrap();
        assert_eq!(pairs["101"], 0.125);
        assert!(parse_channel_pairs("1.0,101,2.0").is_err());
    }

    #[tokio::test]
    async fn test_scan_averaged_over_board_channels() {
        let world = Arc::new(SimWorld::default());
        let daq = Arc::new(
            SimDaq::new(world, BTreeMap::new(), default_port_map())
                .with_channel_value(101, 0.0)
                .with_channel_value(106, 15.0),
        );
        let range = ChannelRange::new(101, 108).unwrap();
        let averages = scanner(daq)
            .scan_averaged(ScanFunction::Voltage, range, 5)
            .await
            .unwrap();
        assert_eq!(averages.len(), 8);
        assert!((averages[&5] - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scan_ports_maps_triplets() {
        let world = Arc::new(SimWorld::default());
        let daq = Arc::new(
            SimDaq::new(world, BTreeMap::new(), default_port_map())
                .with_channel_value(104, 0.002)
                .with_channel_value(105, 0.003),
        );
        let readings = scanner(daq)
            .scan_ports(ScanFunction::AcVoltage, &[Port(2)], 3)
            .await
            .unwrap();
        let reading = readings[&Port(2)];
        assert!((reading.x - 0.002).abs() < 1e-9);
        assert!((reading.y - 0.003).abs() < 1e-9);
        assert_eq!(reading.t, 0.0);
    }

    #[tokio::test]
    async fn test_truncated_scan_is_malformed() {
        let world = Arc::new(SimWorld::default());
        let daq = Arc::new(SimDaq::new(world, BTreeMap::new(), default_port_map()));
        daq.truncate_next_scan();
        let range = ChannelRange::new(101, 103).unwrap();
        let result = scanner(daq).scan_averaged(ScanFunction::Voltage, range, 2).await;
        assert!(matches!(result, Err(CalError::MalformedScan(_))));
    }

    #[tokio::test]
    async fn test_read_data_scales_current_mode() {
        let world = Arc::new(SimWorld::default());
        world.set_angle(90.0);
        let model = SensorModel::linear(SensorType::Accelerometer, 0.4, 0.0);
        let daq = Arc::new(SimDaq::new(
            world,
            BTreeMap::from([(Port(2), model)]),
            default_port_map(),
        ));
        let outcome = scanner(daq)
            .read_data_from_scan(SenseMode::Current, &[Port(2)])
            .await
            .unwrap();
        assert!(!outcome.is_degraded());
        let result = outcome.into_value();
        let reading = result.ports[&Port(2)];
        assert!((reading.x - 4.0).abs() < 1e-9);
        assert_eq!(reading.t, 25.0);
        assert_eq!(result.ambient.plate, 25.0);
    }

    #[tokio::test]
    async fn test_read_data_retries_empty_and_malformed() {
        let world = Arc::new(SimWorld::default());
        let model = SensorModel::linear(SensorType::Accelerometer, 1.0, 0.25);
        let daq = Arc::new(SimDaq::new(
            world,
            BTreeMap::from([(Port(1), model)]),
            default_port_map(),
        ));
        daq.fail_reads_empty(2);
        daq.fail_reads_malformed(1);
        let outcome = scanner(daq.clone())
            .read_data_from_scan(SenseMode::Voltage, &[Port(1)])
            .await
            .unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.value().ports[&Port(1)].x, 0.25);
    }

    #[tokio::test]
    async fn test_read_data_times_out_degraded() {
        let world = Arc::new(SimWorld::default());
        let daq = Arc::new(SimDaq::new(world, BTreeMap::new(), default_port_map()));
        let outcome = scanner(daq)
            .read_data_from_scan(SenseMode::Voltage, &[Port(1)])
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert!(outcome.value().is_empty());
    }
}
