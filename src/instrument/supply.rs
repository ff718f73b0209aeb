//! SCPI bench supply with numbered channels (`APPL CHn,V,A`).

use super::PowerDevice;
use crate::adapters::Transport;
use crate::error::CalResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct ScpiSupply {
    id: String,
    transport: Arc<dyn Transport>,
}

impl ScpiSupply {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
        }
    }
}

#[async_trait]
impl PowerDevice for ScpiSupply {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&self, channel: u8, volts: f64, amps: f64) -> CalResult<()> {
        info!("Supply '{}' CH{} -> {} V, {} A limit", self.id, channel, volts, amps);
        self.transport
            .write(&format!("APPL CH{},{},{}", channel, volts, amps))
            .await
    }

    async fn set_output(&self, channel: u8, enabled: bool) -> CalResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        info!("Supply '{}' CH{} output {}", self.id, channel, state);
        self.transport
            .write(&format!("OUTP CH{},{}", channel, state))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[tokio::test]
    async fn test_rail_commands() {
        let mock = MockTransport::new();
        let supply = ScpiSupply::new("supply", Arc::new(mock.clone()));
        supply.apply(1, 15.0, 0.1).await.unwrap();
        supply.set_output(1, true).await.unwrap();
        supply.set_output(1, false).await.unwrap();
        assert_eq!(
            mock.call_log(),
            vec!["APPL CH1,15,0.1", "OUTP CH1,ON", "OUTP CH1,OFF"]
        );
    }
}
