//! Watlow F4T chamber controller (SCPI over Ethernet).

use super::{parse_reply_float, ThermalDevice};
use crate::adapters::Transport;
use crate::error::CalResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct F4tChamber {
    id: String,
    transport: Arc<dyn Transport>,
    /// Control loop number, 1 on single-loop chambers.
    loop_no: u8,
}

impl F4tChamber {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>, loop_no: u8) -> Self {
        Self {
            id: id.into(),
            transport,
            loop_no,
        }
    }
}

#[async_trait]
impl ThermalDevice for F4tChamber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_setpoint(&self, temp: f64) -> CalResult<()> {
        info!("Chamber '{}' setpoint {} C", self.id, temp);
        self.transport
            .write(&format!("SOURce:CLOop{}:SPOint {}", self.loop_no, temp))
            .await
    }

    async fn read_setpoint(&self) -> CalResult<f64> {
        let reply = self
            .transport
            .query(&format!("SOURce:CLOop{}:SPOint?", self.loop_no))
            .await?;
        parse_reply_float(&self.id, &reply)
    }

    async fn read_process_value(&self) -> CalResult<f64> {
        let reply = self
            .transport
            .query(&format!("SOURCE:CLOOP{}:PVALUE?", self.loop_no))
            .await?;
        parse_reply_float(&self.id, &reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[tokio::test]
    async fn test_setpoint_and_process_value() {
        let mock = MockTransport::new();
        mock.reply("SOURce:CLOop1:SPOint?", "-40.0")
            .reply("SOURCE:CLOOP1:PVALUE?", "-38.7");
        let chamber = F4tChamber::new("chamber", Arc::new(mock.clone()), 1);
        chamber.set_setpoint(-40.0).await.unwrap();
        assert_eq!(chamber.read_setpoint().await.unwrap(), -40.0);
        assert_eq!(chamber.read_process_value().await.unwrap(), -38.7);
        assert_eq!(mock.call_log()[0], "SOURce:CLOop1:SPOint -40");
    }
}
