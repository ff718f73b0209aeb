//! Rotary stage sequencing.
//!
//! [`MotionSequencer`] wraps a [`MotionDevice`] with the settle-by-polling
//! contract the calibration routines rely on. When the stage is wired
//! backwards (`stage.reverse_polarity`), angles are negated here, on the way
//! in and on the way out, so nothing above this layer ever sees controller
//! coordinates.

use crate::config::StageConfig;
use crate::error::{CalError, CalResult, Outcome};
use crate::instrument::MotionDevice;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Moving,
    Settled,
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionState::Idle => "idle",
            MotionState::Moving => "moving",
            MotionState::Settled => "settled",
        };
        f.write_str(name)
    }
}

pub struct MotionSequencer {
    device: Arc<dyn MotionDevice>,
    config: StageConfig,
    state: MotionState,
}

impl MotionSequencer {
    pub fn new(device: Arc<dyn MotionDevice>, config: StageConfig) -> Self {
        Self {
            device,
            config,
            state: MotionState::Idle,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    fn polarity(&self) -> f64 {
        if self.config.reverse_polarity {
            -1.0
        } else {
            1.0
        }
    }

    /// Current position in test coordinates.
    ///
    /// # Errors
    /// - Transport faults
    /// - `Instrument` if the controller returned no samples
    pub async fn read_position(&self) -> CalResult<f64> {
        let reading = self.device.read_position().await?;
        if let Some(err) = reading.uncertainty() {
            debug!("Stage position standard error {:.6} deg", err);
        }
        let raw = reading.value().ok_or_else(|| {
            CalError::Instrument(format!("'{}' returned no position samples", self.device.id()))
        })?;
        Ok(raw * self.polarity())
    }

    /// Moves to `angle` and polls until within `accuracy_deg` or the stage
    /// timeout passes.
    ///
    /// # Returns
    /// - `Success(position)` once settled
    /// - `Degraded(last position)` on timeout; the run may continue
    ///
    /// # Errors
    /// - Transport faults
    pub async fn move_to_angle(&mut self, angle: f64) -> CalResult<Outcome<f64>> {
        info!("Stage moving to {} deg", angle);
        self.state = MotionState::Moving;
        self.device
            .move_absolute(angle * self.polarity(), self.config.speed)
            .await?;
        self.wait_for(angle).await
    }

    /// Moves by `delta` from the current position; otherwise identical to
    /// [`move_to_angle`](Self::move_to_angle).
    pub async fn move_incremental(&mut self, delta: f64) -> CalResult<Outcome<f64>> {
        let current = self.read_position().await?;
        let target = current + delta;
        info!("Stage moving by {} deg to {} deg", delta, target);
        self.state = MotionState::Moving;
        self.device
            .move_incremental(delta * self.polarity(), self.config.speed)
            .await?;
        self.wait_for(target).await
    }

    /// Runs the controller homing routine. Re-read the position afterwards;
    /// home is not guaranteed to be exactly zero.
    pub async fn home(&mut self) -> CalResult<()> {
        info!("Stage homing");
        self.device.home().await?;
        self.state = MotionState::Idle;
        Ok(())
    }

    async fn wait_for(&mut self, target: f64) -> CalResult<Outcome<f64>> {
        let deadline = Instant::now() + self.config.timeout();
        loop {
            let position = self.read_position().await?;
            if (position - target).abs() < self.config.accuracy_deg {
                self.state = MotionState::Settled;
                debug!("Stage settled at {:.4} deg", position);
                return Ok(Outcome::Success(position));
            }
            if Instant::now() >= deadline {
                warn!(
                    "Target angle not reached: commanded {} deg, stage at {:.4} deg",
                    target, position
                );
                self.state = MotionState::Idle;
                return Ok(Outcome::degraded(
                    position,
                    format!("target {} deg not reached", target),
                ));
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::{SimStage, SimWorld};
    use tracing_test::traced_test;

    fn config(reverse: bool) -> StageConfig {
        StageConfig {
            timeout_s: 0.05,
            poll_interval_ms: 1,
            reverse_polarity: reverse,
            ..StageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_move_to_angle_settles() {
        let world = Arc::new(SimWorld::default());
        let mut motion = MotionSequencer::new(Arc::new(SimStage::new(world.clone())), config(false));
        let outcome = motion.move_to_angle(45.0).await.unwrap();
        assert_eq!(outcome, Outcome::Success(45.0));
        assert_eq!(motion.state(), MotionState::Settled);
        assert_eq!(world.angle(), 45.0);
    }

    #[tokio::test]
    async fn test_reverse_polarity_applied_at_boundary() {
        let world = Arc::new(SimWorld::default());
        let mut motion = MotionSequencer::new(Arc::new(SimStage::new(world.clone())), config(true));
        let outcome = motion.move_to_angle(30.0).await.unwrap();
        assert_eq!(world.angle(), -30.0);
        assert_eq!(*outcome.value(), 30.0);
        let outcome = motion.move_incremental(5.0).await.unwrap();
        assert_eq!(world.angle(), -35.0);
        assert_eq!(*outcome.value(), 35.0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stuck_stage_degrades() {
        let world = Arc::new(SimWorld::default());
        let stage = Arc::new(SimStage::new(world));
        stage.set_stuck(true);
        let mut motion = MotionSequencer::new(stage, config(false));
        let outcome = motion.move_to_angle(90.0).await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(*outcome.value(), 0.0);
        assert!(logs_contain("Target angle not reached"));
    }

    #[tokio::test]
    async fn test_transport_fault_propagates() {
        let world = Arc::new(SimWorld::default());
        let stage = Arc::new(SimStage::new(world));
        stage.inject_next_failure();
        let mut motion = MotionSequencer::new(stage, config(false));
        assert!(motion.move_to_angle(10.0).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_home() {
        let world = Arc::new(SimWorld::default());
        world.set_angle(12.0);
        let stage = Arc::new(SimStage::new(world.clone()));
        let mut motion = MotionSequencer::new(stage.clone(), config(false));
        motion.home().await.unwrap();
        assert_eq!(motion.read_position().await.unwrap(), 0.0);
        assert_eq!(motion.state(), MotionState::Idle);
        assert_eq!(stage.call_log(), vec!["home"]);
    }
}
