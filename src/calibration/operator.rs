//! Operator interaction: prompts, remount requests and manual entries.

use crate::error::{CalError, CalResult};
use crate::sensor::UnitUnderTest;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[async_trait]
pub trait Operator: Send + Sync {
    /// Show `prompt` and wait for the operator to confirm.
    async fn acknowledge(&self, prompt: &str) -> CalResult<()>;

    /// Ask for every unit to be remounted with `axis` (labelled `label`)
    /// sensitive to the stage tilt, and wait until that is done.
    async fn remount(&self, axis: usize, label: &str) -> CalResult<()>;

    /// Bandwidth measured by the operator for `unit`, Hz. `None` when the
    /// entry was skipped.
    async fn enter_bandwidth(&self, unit: &UnitUnderTest) -> CalResult<Option<f64>>;
}

/// Operator at the station console.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

impl ConsoleOperator {
    pub fn new() -> Self {
        Self
    }

    async fn ask(&self, prompt: &str) -> CalResult<String> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.write_all(b" ").await?;
        stdout.flush().await?;
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn acknowledge(&self, prompt: &str) -> CalResult<()> {
        self.ask(&format!("{} Press Enter to continue.", prompt)).await?;
        Ok(())
    }

    async fn remount(&self, axis: usize, label: &str) -> CalResult<()> {
        self.ask(&format!(
            "Mount each sensor in the {} orientation (axis {}), then press Enter.",
            label, axis
        ))
        .await?;
        Ok(())
    }

    async fn enter_bandwidth(&self, unit: &UnitUnderTest) -> CalResult<Option<f64>> {
        loop {
            let answer = self
                .ask(&format!(
                    "Bandwidth for {} on {} in Hz (blank to skip):",
                    unit.serial_no, unit.port
                ))
                .await?;
            if answer.is_empty() {
                return Ok(None);
            }
            match answer.parse::<f64>() {
                Ok(value) => return Ok(Some(value)),
                Err(_) => println!("'{}' is not a number", answer),
            }
        }
    }
}

type RemountHook = Box<dyn Fn(usize) + Send + Sync>;

/// Operator that answers from a script. Used by `--simulate` and the tests.
#[derive(Default)]
pub struct ScriptedOperator {
    bandwidths: BTreeMap<String, f64>,
    on_remount: Option<RemountHook>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bandwidth entered for the unit with `serial_no`.
    pub fn with_bandwidth(mut self, serial_no: impl Into<String>, hz: f64) -> Self {
        self.bandwidths.insert(serial_no.into(), hz);
        self
    }

    /// Called with the axis index whenever a remount is requested.
    pub fn on_remount(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_remount = Some(Box::new(hook));
        self
    }

    /// Every prompt shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, prompt: String) {
        info!("Operator prompt: {}", prompt);
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt);
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn acknowledge(&self, prompt: &str) -> CalResult<()> {
        self.record(prompt.to_string());
        Ok(())
    }

    async fn remount(&self, axis: usize, label: &str) -> CalResult<()> {
        self.record(format!("remount {} ({})", label, axis));
        if let Some(hook) = &self.on_remount {
            hook(axis);
        }
        Ok(())
    }

    async fn enter_bandwidth(&self, unit: &UnitUnderTest) -> CalResult<Option<f64>> {
        self.record(format!("bandwidth {}", unit.serial_no));
        Ok(self.bandwidths.get(&unit.serial_no).copied())
    }
}

/// Parses `PORT_n=SERIAL` unit assignments from the command line.
pub fn parse_unit_assignment(text: &str, part_no: &str) -> CalResult<UnitUnderTest> {
    let (port, serial) = text.split_once('=').ok_or_else(|| {
        CalError::Configuration(format!("expected PORT_n=SERIAL, got '{}'", text))
    })?;
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(CalError::Configuration(format!("missing serial number in '{}'", text)));
    }
    Ok(UnitUnderTest::new(serial, part_no, port.parse()?))
}
