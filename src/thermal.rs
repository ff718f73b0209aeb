//! Chamber ramp and soak.
//!
//! This is a best-effort convergence loop, not a controller: the ramp keeps
//! re-issuing the same setpoint while the plate temperature approaches it,
//! and the soak corrects the setpoint once at entry and then only waits.
//! Drift during the soak window is logged at the end but never corrected.

use crate::acquisition::ChannelScanner;
use crate::config::ChamberConfig;
use crate::error::{CalResult, Outcome};
use crate::analysis::tolerance::measurement_within_tol;
use crate::instrument::ThermalDevice;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Blocking wait that logs the time remaining every `tick`.
pub async fn countdown(label: &str, total: Duration, tick: Duration) {
    if total.is_zero() {
        return;
    }
    let tick = tick.max(Duration::from_millis(1));
    let end = Instant::now() + total;
    info!("{}: waiting {}", label, format_hms(total));
    loop {
        let now = Instant::now();
        if now >= end {
            break;
        }
        let remaining = end - now;
        sleep(remaining.min(tick)).await;
        let left = end.saturating_duration_since(Instant::now());
        if !left.is_zero() {
            info!("{}: {} remaining", label, format_hms(left));
        }
    }
}

fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub struct ThermalSequencer {
    chamber: Arc<dyn ThermalDevice>,
    config: ChamberConfig,
}

impl ThermalSequencer {
    pub fn new(chamber: Arc<dyn ThermalDevice>, config: ChamberConfig) -> Self {
        Self { chamber, config }
    }

    /// Sets the chamber to `target` and polls the plate temperature until it
    /// is within `tolerance` or `timeout` passes.
    ///
    /// # Returns
    /// - `Success(plate temperature)` once within tolerance
    /// - `Degraded(last plate temperature)` on timeout
    ///
    /// # Errors
    /// - Transport faults from the chamber
    pub async fn ramp_to_temperature(
        &self,
        scanner: &ChannelScanner,
        target: f64,
        tolerance: f64,
        timeout: Duration,
    ) -> CalResult<Outcome<f64>> {
        info!("Ramping chamber '{}' to {} C", self.chamber.id(), target);
        let deadline = Instant::now() + timeout;
        loop {
            self.chamber.set_setpoint(target).await?;
            let plate = scanner.plate_temperature().await;
            if measurement_within_tol(plate, target, tolerance) {
                info!("Plate at {:.2} C, within {} C of {} C", plate, tolerance, target);
                return Ok(Outcome::Success(plate));
            }
            if Instant::now() >= deadline {
                let chamber = self.chamber.read_process_value().await?;
                warn!(
                    "Ramp to {} C timed out: plate {:.2} C, chamber {:.2} C",
                    target, plate, chamber
                );
                return Ok(Outcome::degraded(
                    plate,
                    format!("plate did not reach {} C", target),
                ));
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Holds at `target` for `duration_min` minutes.
    ///
    /// If the plate is out of tolerance at entry the setpoint is re-issued
    /// once; no further correction happens during the soak.
    ///
    /// # Returns
    /// - `Success(plate temperature)` when still within tolerance at the end
    /// - `Degraded(plate temperature)` when it drifted out during the soak
    pub async fn soak_at_temperature(
        &self,
        scanner: &ChannelScanner,
        target: f64,
        tolerance: f64,
        duration_min: f64,
    ) -> CalResult<Outcome<f64>> {
        let plate = scanner.plate_temperature().await;
        if !measurement_within_tol(plate, target, tolerance) {
            warn!(
                "Plate at {:.2} C outside {} ± {} C at soak start, re-issuing setpoint",
                plate, target, tolerance
            );
            self.chamber.set_setpoint(target).await?;
        }
        let setpoint = self.chamber.read_setpoint().await?;
        info!("Soaking at {} C (setpoint {} C) for {} min", target, setpoint, duration_min);
        countdown(
            "Soak",
            Duration::from_secs_f64(duration_min.max(0.0) * 60.0),
            self.config.countdown_tick(),
        )
        .await;

        let plate = scanner.plate_temperature().await;
        if measurement_within_tol(plate, target, tolerance) {
            Ok(Outcome::Success(plate))
        } else {
            warn!("Plate drifted to {:.2} C during soak at {} C", plate, target);
            Ok(Outcome::degraded(plate, format!("plate drifted from {} C", target)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_port_map, DaqConfig};
    use crate::instrument::sim::{SimChamber, SimDaq, SimWorld};
    use std::collections::BTreeMap;

    fn rig(world: Arc<SimWorld>) -> (ChannelScanner, Arc<SimChamber>, ThermalSequencer) {
        let daq = Arc::new(SimDaq::new(world.clone(), BTreeMap::new(), default_port_map()));
        let scanner = ChannelScanner::new(daq.clone(), daq, DaqConfig::default());
        let chamber = Arc::new(SimChamber::new(world));
        let config = ChamberConfig {
            poll_interval_s: 0.001,
            countdown_tick_ms: 1,
            ..ChamberConfig::default()
        };
        let thermal = ThermalSequencer::new(chamber.clone(), config);
        (scanner, chamber, thermal)
    }

    #[tokio::test]
    async fn test_ramp_converges() {
        let world = Arc::new(SimWorld::default());
        let (scanner, _chamber, thermal) = rig(world.clone());
        let outcome = thermal
            .ramp_to_temperature(&scanner, -40.0, 1.0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success(-40.0));
        assert_eq!(world.chamber_temp(), -40.0);
    }

    #[tokio::test]
    async fn test_ramp_times_out_degraded() {
        let world = Arc::new(SimWorld::default());
        let (scanner, chamber, thermal) = rig(world);
        chamber.set_sluggish(true);
        let outcome = thermal
            .ramp_to_temperature(&scanner, 85.0, 1.0, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(*outcome.value(), 25.0);
        assert_eq!(chamber.read_setpoint().await.unwrap(), 85.0);
    }

    #[tokio::test]
    async fn test_soak_resets_setpoint_once() {
        let world = Arc::new(SimWorld::default());
        let (scanner, chamber, thermal) = rig(world.clone());
        let outcome = thermal
            .soak_at_temperature(&scanner, 60.0, 0.5, 0.0)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success(60.0));
        assert_eq!(chamber.setpoint_writes(), 1);

        // Already within tolerance: no correction.
        thermal
            .soak_at_temperature(&scanner, 60.0, 0.5, 0.0)
            .await
            .unwrap();
        assert_eq!(chamber.setpoint_writes(), 1);
    }

    #[tokio::test]
    async fn test_soak_never_corrects_drift() {
        let world = Arc::new(SimWorld::default());
        let (scanner, chamber, thermal) = rig(world.clone());
        chamber.set_sluggish(true);
        let outcome = thermal
            .soak_at_temperature(&scanner, 60.0, 0.5, 0.0)
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(chamber.setpoint_writes(), 1);
    }

    #[tokio::test]
    async fn test_countdown_waits() {
        let start = std::time::Instant::now();
        countdown("test", Duration::from_millis(15), Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(3725)), "01:02:05");
    }
}
