//! Aerotech Ensemble rotary stage over its ASCII command interface.

use super::{parse_reply_float, MotionDevice, PositionReading};
use crate::adapters::Transport;
use crate::error::CalResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct EnsembleStage {
    id: String,
    transport: Arc<dyn Transport>,
    axis: String,
    points_to_read: usize,
}

impl EnsembleStage {
    /// `points_to_read > 1` makes every position read a burst of samples.
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        axis: impl Into<String>,
        points_to_read: usize,
    ) -> Self {
        Self {
            id: id.into(),
            transport,
            axis: axis.into(),
            points_to_read: points_to_read.max(1),
        }
    }
}

#[async_trait]
impl MotionDevice for EnsembleStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn move_absolute(&self, angle: f64, speed: f64) -> CalResult<()> {
        info!("Stage '{}' moving to {} deg", self.id, angle);
        self.transport
            .write(&format!(
                "MOVEABS {axis} {angle} {axis}F {speed}",
                axis = self.axis
            ))
            .await
    }

    async fn move_incremental(&self, delta: f64, speed: f64) -> CalResult<()> {
        info!("Stage '{}' moving by {} deg", self.id, delta);
        self.transport
            .write(&format!(
                "MOVEINC {axis} {delta} {axis}F {speed}",
                axis = self.axis
            ))
            .await
    }

    async fn read_position(&self) -> CalResult<PositionReading> {
        let command = format!("PCMD({})", self.axis);
        let mut samples = Vec::with_capacity(self.points_to_read);
        for _ in 0..self.points_to_read {
            let reply = self.transport.query(&command).await?;
            samples.push(parse_reply_float(&self.id, &reply)?);
        }
        Ok(match samples.as_slice() {
            [single] => PositionReading::Single(*single),
            _ => PositionReading::Samples(samples),
        })
    }

    async fn home(&self) -> CalResult<()> {
        info!("Stage '{}' homing", self.id);
        self.transport.write(&format!("HOME({})", self.axis)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[tokio::test]
    async fn test_move_commands() {
        let mock = MockTransport::new();
        let stage = EnsembleStage::new("stage", Arc::new(mock.clone()), "X", 1);
        stage.move_absolute(-90.0, 25.0).await.unwrap();
        stage.move_incremental(2.5, 25.0).await.unwrap();
        stage.home().await.unwrap();
        assert_eq!(
            mock.call_log(),
            vec!["MOVEABS X -90 XF 25", "MOVEINC X 2.5 XF 25", "HOME(X)"]
        );
    }

    #[tokio::test]
    async fn test_position_strips_percent() {
        let mock = MockTransport::new();
        mock.reply("PCMD(X)", "%45.0001");
        let stage = EnsembleStage::new("stage", Arc::new(mock.clone()), "X", 1);
        assert_eq!(
            stage.read_position().await.unwrap(),
            PositionReading::Single(45.0001)
        );
    }

    #[tokio::test]
    async fn test_position_burst() {
        let mock = MockTransport::new();
        mock.queue_reply("PCMD(X)", "%1.0")
            .queue_reply("PCMD(X)", "%3.0")
            .reply("PCMD(X)", "%2.0");
        let stage = EnsembleStage::new("stage", Arc::new(mock.clone()), "X", 3);
        let reading = stage.read_position().await.unwrap();
        assert_eq!(reading, PositionReading::Samples(vec![1.0, 3.0, 2.0]));
        assert_eq!(reading.value(), Some(2.0));
    }
}
