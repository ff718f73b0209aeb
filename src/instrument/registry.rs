//! Builds the station's instruments from configuration.
//!
//! Each role is matched on its configured vendor. Hardware roles open a
//! [`TcpTransport`] through [`connect_with_retry`]; simulated roles share one
//! [`SimWorld`] so the stage angle and chamber temperature reach every
//! simulated sensor.

use super::aerotech::EnsembleStage;
use super::keithley::Daq6510;
use super::sim::{SensorModel, SimChamber, SimDaq, SimSensorBus, SimStage, SimSupply, SimWorld};
use super::supply::ScpiSupply;
use super::watlow::F4tChamber;
use super::{MotionDevice, PowerDevice, ScanDevice, SensorBus, ThermalDevice, Thermometer};
use crate::acquisition::ChannelScanner;
use crate::adapters::tcp::TcpTransport;
use crate::adapters::Transport;
use crate::calibration::board::BOARD_CHANNEL_LABELS;
use crate::calibration::orchestrator::Station;
use crate::config::{ChamberVendor, DaqVendor, StageVendor, StationConfig, SupplyVendor};
use crate::error::CalResult;
use crate::error_recovery::connect_with_retry;
use crate::motion::MotionSequencer;
use crate::sensor::{Port, SensorSpec, UnitUnderTest};
use crate::thermal::ThermalSequencer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const SCPI_TERMINATOR: &str = "\n";

/// Instruments filling each station role.
pub struct StationDevices {
    pub scan: Arc<dyn ScanDevice>,
    pub thermometer: Arc<dyn Thermometer>,
    pub stage: Arc<dyn MotionDevice>,
    pub chamber: Option<Arc<dyn ThermalDevice>>,
    pub supply: Option<Arc<dyn PowerDevice>>,
    pub bus: Option<Arc<dyn SensorBus>>,
}

async fn open(config: &StationConfig, role: &str, address: &str) -> CalResult<Arc<dyn Transport>> {
    let timeout = config.connection.io_timeout();
    let transport = connect_with_retry(role, &config.connection.retry_policy(), || {
        TcpTransport::connect(address, SCPI_TERMINATOR, timeout)
    })
    .await?;
    Ok(Arc::new(transport))
}

impl StationDevices {
    /// Connects every configured role.
    ///
    /// Roles configured as `simulated` get in-memory devices without sensor
    /// models. No hardware sensor bus is supported, so `bus` is `None`.
    ///
    /// # Errors
    /// Transport faults after the retry policy is exhausted.
    pub async fn connect(config: &StationConfig) -> CalResult<Self> {
        let world = Arc::new(SimWorld::default());

        let (scan, thermometer): (Arc<dyn ScanDevice>, Arc<dyn Thermometer>) = match config.daq.vendor {
            DaqVendor::Keithley => {
                let transport = open(config, "daq", &config.daq.address).await?;
                let daq = Daq6510::new(
                    "daq",
                    transport,
                    config.daq.plate_channels.clone(),
                    config.daq.pillar_channels.clone(),
                )
                .with_thermistor(config.daq.thermistor);
                daq.identify().await?;
                let daq = Arc::new(daq);
                (daq.clone(), daq)
            }
            DaqVendor::Simulated => {
                let daq = Arc::new(SimDaq::new(world.clone(), BTreeMap::new(), config.daq.port_map.clone()));
                (daq.clone(), daq)
            }
        };

        let stage: Arc<dyn MotionDevice> = match config.stage.vendor {
            StageVendor::Ensemble => {
                let transport = open(config, "stage", &config.stage.address).await?;
                Arc::new(EnsembleStage::new(
                    "stage",
                    transport,
                    config.stage.axis.clone(),
                    config.stage.points_to_read,
                ))
            }
            StageVendor::Simulated => Arc::new(SimStage::new(world.clone())),
        };

        let chamber: Option<Arc<dyn ThermalDevice>> = if !config.chamber.available {
            None
        } else {
            match config.chamber.vendor {
                ChamberVendor::WatlowF4t => {
                    let transport = open(config, "chamber", &config.chamber.address).await?;
                    Some(Arc::new(F4tChamber::new(
                        "chamber",
                        transport,
                        config.chamber.control_loop,
                    )))
                }
                ChamberVendor::Simulated => Some(Arc::new(SimChamber::new(world.clone()))),
            }
        };

        let supply: Option<Arc<dyn PowerDevice>> = match config.supply.vendor {
            SupplyVendor::None => None,
            SupplyVendor::Scpi => {
                let transport = open(config, "supply", &config.supply.address).await?;
                Some(Arc::new(ScpiSupply::new("supply", transport)))
            }
            SupplyVendor::Simulated => Some(Arc::new(SimSupply::new())),
        };

        info!(
            "Station '{}' connected: scanner '{}', stage '{}', chamber {}, supply {}",
            config.application.station_name,
            scan.id(),
            stage.id(),
            chamber.as_ref().map_or("none", |c| c.id()),
            supply.as_ref().map_or("none", |s| s.id()),
        );
        Ok(Self {
            scan,
            thermometer,
            stage,
            chamber,
            supply,
            bus: None,
        })
    }

    /// Fully simulated station with a nominal unit on each port.
    ///
    /// Analog units sit on the scanner, digital units on a simulated bus.
    /// The returned world lets the caller follow operator remounts.
    pub fn simulated(
        config: &StationConfig,
        spec: &SensorSpec,
        units: &[UnitUnderTest],
    ) -> (Self, Arc<SimWorld>) {
        let models: BTreeMap<Port, SensorModel> = units
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let mut model =
                    SensorModel::linear(spec.sensor_type, spec.limits.scale_factor, 0.001 * (i as f64 + 1.0));
                model.cross_bias = 0.0005;
                (unit.port, model)
            })
            .collect();
        let counts_per_g = spec.output_type.is_digital().then_some(spec.limits.nominal_adc);
        Self::simulated_with(config, models, counts_per_g)
    }

    /// Simulated station with the given sensor models. With `counts_per_g`
    /// the models answer on a sensor bus, otherwise on the scanner. Board
    /// rails read their nominal voltage.
    pub fn simulated_with(
        config: &StationConfig,
        models: BTreeMap<Port, SensorModel>,
        counts_per_g: Option<f64>,
    ) -> (Self, Arc<SimWorld>) {
        let world = Arc::new(SimWorld::default());
        let (analog_models, bus) = match counts_per_g {
            Some(counts) => {
                let bus: Arc<dyn SensorBus> = Arc::new(SimSensorBus::new(world.clone(), models, counts));
                (BTreeMap::new(), Some(bus))
            }
            None => (models, None),
        };
        let mut daq = SimDaq::new(world.clone(), analog_models, config.daq.port_map.clone());
        for rail in &config.supply.rails {
            if let Some(offset) = BOARD_CHANNEL_LABELS.iter().position(|l| *l == rail.label) {
                daq = daq.with_channel_value(config.daq.board_voltage_channels.start + offset as u32, rail.volts);
            }
        }
        let daq = Arc::new(daq);

        let devices = Self {
            scan: daq.clone(),
            thermometer: daq,
            stage: Arc::new(SimStage::new(world.clone())),
            chamber: Some(Arc::new(SimChamber::new(world.clone()))),
            supply: Some(Arc::new(SimSupply::new())),
            bus,
        };
        (devices, world)
    }

    /// Wraps the devices in their sequencers.
    pub fn into_station(self, config: &StationConfig) -> Station {
        Station {
            scanner: ChannelScanner::new(self.scan, self.thermometer, config.daq.clone()),
            motion: MotionSequencer::new(self.stage, config.stage.clone()),
            thermal: self
                .chamber
                .map(|chamber| ThermalSequencer::new(chamber, config.chamber.clone())),
            supply: self.supply,
            bus: self.bus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupplyConfig;
    use crate::sensor::OutputType;

    fn spec(output_type: OutputType) -> SensorSpec {
        toml::from_str::<SensorSpec>(&format!(
            r#"
part_no = "ACC-1"
sensor_type = "accelerometer"
output_type = "{}"
input_units = "g"
output_units = "V"
axes_no = 2
range = 1.0
linearity_points = 5
cycles = 1
soak_time_min = 0.0
settle_time_s = 0.0
mount = ["X", "Y"]

[limits]
scale_factor = 2.0
nominal_adc = 16384.0
"#,
            match output_type {
                OutputType::AnalogVoltage => "analog_voltage",
                OutputType::AnalogCurrent => "analog_current",
                OutputType::Digital => "digital",
            }
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_simulated_station_roles() {
        let config = StationConfig {
            supply: SupplyConfig::default(),
            ..StationConfig::default()
        };
        let units = vec![UnitUnderTest::new("SN1", "ACC-1", Port(1))];

        let (analog, _) = StationDevices::simulated(&config, &spec(OutputType::AnalogVoltage), &units);
        assert!(analog.bus.is_none());
        let station = analog.into_station(&config);
        assert!(station.thermal.is_some());
        assert!(station.supply.is_some());

        let (digital, world) = StationDevices::simulated(&config, &spec(OutputType::Digital), &units);
        let bus = digital.bus.clone().unwrap();
        world.set_angle(90.0);
        let reading = bus.read_outputs(Port(1)).await.unwrap();
        assert!((reading.x - (2.0 + 0.001)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_connect_all_simulated() {
        let mut config = StationConfig::default();
        config.stage.vendor = StageVendor::Simulated;
        config.daq.vendor = DaqVendor::Simulated;
        config.chamber.available = false;
        config.supply.vendor = SupplyVendor::None;
        let devices = StationDevices::connect(&config).await.unwrap();
        assert_eq!(devices.stage.id(), "sim-stage");
        assert!(devices.chamber.is_none());
        assert!(devices.supply.is_none());
    }

    #[tokio::test]
    async fn test_connect_keithley_identifies() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;
        use tokio::sync::mpsc;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = seen_tx.send(line.clone());
                if line == "*IDN?" {
                    write
                        .write_all(b"KEITHLEY INSTRUMENTS,MODEL DAQ6510,04412345,1.7.5\n")
                        .await
                        .unwrap();
                }
            }
        });

        let mut config = StationConfig::default();
        config.daq.vendor = DaqVendor::Keithley;
        config.daq.address = addr;
        config.stage.vendor = StageVendor::Simulated;
        config.chamber.available = false;
        config.supply.vendor = SupplyVendor::None;
        let devices = StationDevices::connect(&config).await.unwrap();
        assert_eq!(devices.scan.id(), "daq");
        assert_eq!(seen_rx.recv().await.as_deref(), Some("*IDN?"));
    }
}
