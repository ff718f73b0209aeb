//! Board power-rail check.
//!
//! The bed-of-nails fixture exposes the sensor board on the scanner: eight
//! voltage channels followed by twelve resistance channels. Resistances are
//! read with the supply off, voltages with the rails powered. Readings are
//! labelled in scan order (voltage block, then resistance block) and every
//! configured rail is compared with its nominal voltage.

use crate::acquisition::ChannelScanner;
use crate::analysis::tolerance::{Limit, LimitCheck};
use crate::config::{DaqConfig, RailConfig};
use crate::error::{CalError, CalResult};
use crate::instrument::{PowerDevice, ScanFunction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Fixture labels in scan order: voltage channels first, then resistances.
pub const BOARD_CHANNEL_LABELS: [&str; 20] = [
    "GND",
    "mems_X",
    "mems_Y",
    "mems_Z",
    "mems_T",
    "PWR+",
    "VCC",
    "PWR-",
    "R_bias_X",
    "R_offset_X",
    "R_gnd_X",
    "R_scale_X",
    "R_bias_Y",
    "R_offset_Y",
    "R_gnd_Y",
    "R_scale_Y",
    "R_bias_Z",
    "R_offset_Z",
    "R_gnd_Z",
    "R_scale_Z",
];

/// Labelled board readings and the rail comparisons made on them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardCheck {
    pub readings: BTreeMap<String, f64>,
    pub checks: Vec<LimitCheck>,
}

impl BoardCheck {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Joins the averaged voltage and resistance blocks and labels them in scan
/// order. Channels past the label table are named `CH<n>` by position.
pub fn label_readings(
    voltage: &BTreeMap<usize, f64>,
    resistance: &BTreeMap<usize, f64>,
) -> BTreeMap<String, f64> {
    voltage
        .values()
        .chain(resistance.values())
        .enumerate()
        .map(|(i, &value)| {
            let label = BOARD_CHANNEL_LABELS
                .get(i)
                .map(|l| l.to_string())
                .unwrap_or_else(|| format!("CH{}", i));
            (label, value)
        })
        .collect()
}

/// Compares each rail's labelled reading with `volts ± tolerance`.
///
/// # Errors
/// `Configuration` if a rail label has no reading.
pub fn check_rails(readings: &BTreeMap<String, f64>, rails: &[RailConfig]) -> CalResult<Vec<LimitCheck>> {
    rails
        .iter()
        .map(|rail| {
            let measured = readings.get(&rail.label).copied().ok_or_else(|| {
                CalError::Configuration(format!("no board channel labelled '{}'", rail.label))
            })?;
            Ok(LimitCheck::evaluate(
                rail.label.clone(),
                measured,
                Limit::Symmetric {
                    target: rail.volts,
                    tol: rail.tolerance,
                },
            ))
        })
        .collect()
}

async fn rails_off(supply: &dyn PowerDevice, rails: &[RailConfig]) -> CalResult<()> {
    for rail in rails {
        supply.set_output(rail.channel, false).await?;
    }
    Ok(())
}

/// Runs the resistance scan unpowered, then the voltage scan powered, and
/// checks the rails. The supply is left off.
///
/// # Errors
/// - Transport faults from the scanner or supply
/// - `MalformedScan` for a short buffer
pub async fn run_board_check(
    scanner: &ChannelScanner,
    supply: &dyn PowerDevice,
    daq: &DaqConfig,
    rails: &[RailConfig],
) -> CalResult<BoardCheck> {
    info!("Board check on '{}'", supply.id());
    rails_off(supply, rails).await?;
    let resistance = scanner
        .scan_averaged(
            ScanFunction::Resistance,
            daq.board_resistance_channels,
            daq.board_scan_cycles,
        )
        .await?;

    for rail in rails {
        supply.apply(rail.channel, rail.volts, rail.current_limit).await?;
        supply.set_output(rail.channel, true).await?;
    }
    let voltage = scanner
        .scan_averaged(
            ScanFunction::Voltage,
            daq.board_voltage_channels,
            daq.board_scan_cycles,
        )
        .await;
    rails_off(supply, rails).await?;
    let voltage = voltage?;

    let readings = label_readings(&voltage, &resistance);
    let checks = check_rails(&readings, rails)?;
    for check in checks.iter().filter(|c| !c.passed) {
        warn!("{} out of tolerance: {:.4} V, expected {}", check.name, check.measured, check.limit);
    }
    Ok(BoardCheck { readings, checks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_port_map, SupplyConfig};
    use crate::instrument::sim::{SimDaq, SimSupply, SimWorld};
    use std::sync::Arc;

    fn fast_daq() -> DaqConfig {
        DaqConfig {
            voltage_secs_per_cycle: 0.0,
            resistance_secs_per_cycle: 0.0,
            inter_channel_delay_s: 0.0,
            ..DaqConfig::default()
        }
    }

    #[test]
    fn test_labels_follow_scan_order() {
        let voltage: BTreeMap<usize, f64> = (0..8).map(|i| (i, i as f64)).collect();
        let resistance: BTreeMap<usize, f64> = (0..13).map(|i| (i, 1000.0 + i as f64)).collect();
        let labelled = label_readings(&voltage, &resistance);
        assert_eq!(labelled["PWR+"], 5.0);
        assert_eq!(labelled["PWR-"], 7.0);
        assert_eq!(labelled["R_bias_X"], 1000.0);
        assert_eq!(labelled["R_scale_Z"], 1011.0);
        assert_eq!(labelled["CH20"], 1012.0);
    }

    #[tokio::test]
    async fn test_board_check_flags_low_rail() {
        let world = Arc::new(SimWorld::default());
        let daq = Arc::new(
            SimDaq::new(world, BTreeMap::new(), default_port_map())
                .with_channel_value(106, 15.02)
                .with_channel_value(108, -14.2)
                .with_channel_value(109, 10_000.0),
        );
        let scanner = ChannelScanner::new(daq.clone(), daq, fast_daq());
        let supply = SimSupply::new();
        let rails = SupplyConfig::default().rails;

        let result = run_board_check(&scanner, &supply, &fast_daq(), &rails).await.unwrap();
        assert!((result.readings["R_bias_X"] - 10_000.0).abs() < 1e-6);
        assert!(result.checks[0].passed);
        assert!(!result.checks[1].passed);
        assert!(!result.passed());
        let log = supply.call_log();
        assert_eq!(log.last().map(String::as_str), Some("output CH2 false"));
        assert!(log.contains(&"apply CH1 15 0.1".to_string()));
    }
}
