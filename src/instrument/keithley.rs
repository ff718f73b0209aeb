//! Keithley DAQ6510 multiplexing scanner.
//!
//! Implements both the scan role and the thermometry role: the plate and air
//! thermocouples (or thermistors) are wired to the same mainframe as the
//! sensor channels.

use super::{AmbientTemperatures, ChannelRange, ScanDevice, ScanFunction, Thermometer};
use crate::adapters::Transport;
use crate::analysis::conversion::thermistor_to_celsius;
use crate::config::ThermistorConfig;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Daq6510 {
    id: String,
    transport: Arc<dyn Transport>,
    plate_channels: Vec<u32>,
    pillar_channels: Vec<u32>,
    thermistor: Option<ThermistorConfig>,
}

impl Daq6510 {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        plate_channels: Vec<u32>,
        pillar_channels: Vec<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            transport,
            plate_channels,
            pillar_channels,
            thermistor: None,
        }
    }

    /// Read the plate and pillar channels as NTC thermistors.
    pub fn with_thermistor(mut self, thermistor: Option<ThermistorConfig>) -> Self {
        self.thermistor = thermistor;
        self
    }

    /// Confirms the instrument answers `*IDN?`.
    pub async fn identify(&self) -> CalResult<String> {
        let idn = self.transport.query("*IDN?").await?;
        info!("DAQ '{}' identified as {}", self.id, idn);
        Ok(idn)
    }

    fn function_name(function: ScanFunction) -> &'static str {
        match function {
            ScanFunction::Voltage => "VOLT",
            ScanFunction::Resistance => "RES",
            ScanFunction::AcVoltage => "VOLT:AC",
        }
    }

    fn channel_list(channels: &[u32]) -> String {
        let list: Vec<String> = channels.iter().map(u32::to_string).collect();
        format!("(@{})", list.join(","))
    }
}

#[async_trait]
impl ScanDevice for Daq6510 {
    fn id(&self) -> &str {
        &self.id
    }

    async fn configure(&self, function: ScanFunction, channels: ChannelRange) -> CalResult<()> {
        debug!("DAQ '{}' sensing {} on {}", self.id, function, channels);
        self.transport
            .write(&format!("SENS:FUNC '{}', {}", Self::function_name(function), channels))
            .await
    }

    async fn set_scan(&self, channels: ChannelRange, delay: Duration, cycles: u32) -> CalResult<()> {
        self.transport
            .write(&format!("ROUT:DEL {}, {}", delay.as_secs_f64(), channels))
            .await?;
        self.transport
            .write(&format!("ROUT:SCAN:COUN:SCAN {}", cycles))
            .await?;
        self.transport
            .write(&format!("ROUT:SCAN:CRE {}", channels))
            .await
    }

    async fn trigger(&self) -> CalResult<()> {
        self.transport.write("INIT").await
    }

    async fn wait_complete(&self) -> CalResult<()> {
        self.transport.write("*WAI").await
    }

    async fn buffer_extent(&self) -> CalResult<(u32, u32)> {
        let parse = |reply: String| {
            reply.trim().parse::<u32>().map_err(|_| {
                CalError::MalformedScan(format!("buffer index '{}' is not an integer", reply.trim()))
            })
        };
        let start = parse(self.transport.query(":TRAC:ACT:STAR?").await?)?;
        let end = parse(self.transport.query(":TRAC:ACT:END?").await?)?;
        Ok((start, end))
    }

    async fn read_buffer(&self, start: u32, end: u32) -> CalResult<String> {
        self.transport
            .query(&format!(":TRAC:DATA? {}, {}, \"defbuffer1\", READ", start, end))
            .await
    }

    async fn clear_buffer(&self) -> CalResult<()> {
        self.transport.write(":TRAC:CLE").await
    }

    async fn open_all(&self) -> CalResult<()> {
        self.transport.write("ROUT:OPEN:ALL").await
    }

    async fn read_channels(&self) -> CalResult<String> {
        self.transport.write(":TRAC:CLE").await?;
        self.transport.write("ROUT:SCAN:COUN:SCAN 1").await?;
        self.transport.write("INIT").await?;
        self.transport.write("*WAI").await?;
        let (start, end) = self.buffer_extent().await?;
        if end < start || end == 0 {
            return Ok(String::new());
        }
        self.transport
            .query(&format!(
                ":TRAC:DATA? {}, {}, \"defbuffer1\", READ, CHAN",
                start, end
            ))
            .await
    }
}

#[async_trait]
impl Thermometer for Daq6510 {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_temperatures(&self) -> CalResult<AmbientTemperatures> {
        let channels: Vec<u32> = self
            .plate_channels
            .iter()
            .chain(&self.pillar_channels)
            .copied()
            .collect();
        let function = if self.thermistor.is_some() { "RES" } else { "TEMP" };
        let reply = self
            .transport
            .query(&format!("MEAS:{}? {}", function, Self::channel_list(&channels)))
            .await?;
        let mut readings = reply
            .split(',')
            .map(|tok| {
                tok.trim().parse::<f64>().map_err(|_| {
                    CalError::MalformedScan(format!("temperature token '{}'", tok.trim()))
                })
            })
            .collect::<CalResult<Vec<f64>>>()?;
        if let Some(t) = &self.thermistor {
            for value in &mut readings {
                *value = thermistor_to_celsius(*value, t.r0_ohms, t.t0_c, t.beta);
            }
        }
        let plate: Vec<usize> = (0..self.plate_channels.len()).collect();
        let pillar: Vec<usize> = (plate.len()..channels.len()).collect();
        AmbientTemperatures::from_channels(&readings, &plate, &pillar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn daq(mock: &MockTransport) -> Daq6510 {
        Daq6510::new("daq", Arc::new(mock.clone()), vec![119], vec![120])
    }

    #[tokio::test]
    async fn test_scan_command_sequence() {
        let mock = MockTransport::new();
        let daq = daq(&mock);
        let range = ChannelRange::new(101, 108).unwrap();
        daq.configure(ScanFunction::Voltage, range).await.unwrap();
        daq.set_scan(range, Duration::from_millis(100), 5).await.unwrap();
        daq.trigger().await.unwrap();
        daq.wait_complete().await.unwrap();
        assert_eq!(
            mock.call_log(),
            vec![
                "SENS:FUNC 'VOLT', (@101:108)",
                "ROUT:DEL 0.1, (@101:108)",
                "ROUT:SCAN:COUN:SCAN 5",
                "ROUT:SCAN:CRE (@101:108)",
                "INIT",
                "*WAI",
            ]
        );
    }

    #[tokio::test]
    async fn test_buffer_read() {
        let mock = MockTransport::new();
        mock.reply(":TRAC:ACT:STAR?", "1")
            .reply(":TRAC:ACT:END?", "3")
            .reply(":TRAC:DATA? 1, 3, \"defbuffer1\", READ", "1.0,2.0,3.0");
        let daq = daq(&mock);
        let (start, end) = daq.buffer_extent().await.unwrap();
        assert_eq!((start, end), (1, 3));
        assert_eq!(daq.read_buffer(start, end).await.unwrap(), "1.0,2.0,3.0");
    }

    #[tokio::test]
    async fn test_thermometry_split() {
        let mock = MockTransport::new();
        mock.reply("MEAS:TEMP? (@119,120)", "24.5,26.0");
        let temps = daq(&mock).read_temperatures().await.unwrap();
        assert_eq!(temps.plate, 24.5);
        assert_eq!(temps.pillar, 26.0);
    }

    #[tokio::test]
    async fn test_thermistor_thermometry() {
        let mock = MockTransport::new();
        mock.reply("MEAS:RES? (@119,120)", "10000.0,20000.0");
        let daq = daq(&mock).with_thermistor(Some(ThermistorConfig::default()));
        let temps = daq.read_temperatures().await.unwrap();
        assert!((temps.plate - 25.0).abs() < 1e-9);
        let expected = thermistor_to_celsius(20_000.0, 10_000.0, 25.0, 3950.0);
        assert!((temps.pillar - expected).abs() < 1e-9);
        assert!(temps.pillar < 25.0);
    }

    #[tokio::test]
    async fn test_identify() {
        let mock = MockTransport::new();
        mock.reply("*IDN?", "KEITHLEY INSTRUMENTS,MODEL DAQ6510,04412345,1.7.5");
        let idn = daq(&mock).identify().await.unwrap();
        assert!(idn.contains("DAQ6510"));
        assert_eq!(mock.call_log(), vec!["*IDN?"]);
    }
}
