//! `mems-cal`: station command line.
//!
//! ```text
//! mems-cal run ACC-2G-3 PORT_1=SN001 PORT_2=SN002
//! mems-cal run DIG-8G-3 PORT_1=SN100 --family tumble --simulate
//! mems-cal analyze data/part_no_ACC-2G-3_serialno_SN001.csv --part ACC-2G-3
//! mems-cal board-check
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mems_cal::analysis::reduction::ReductionEngine;
use mems_cal::calibration::board::run_board_check;
use mems_cal::calibration::log::{read_records, serial_from_file_name};
use mems_cal::calibration::operator::{parse_unit_assignment, ConsoleOperator, Operator, ScriptedOperator};
use mems_cal::calibration::orchestrator::reduce_unit;
use mems_cal::calibration::{CalibrationOrchestrator, RunReport, TestFamily};
use mems_cal::config::StationConfig;
use mems_cal::error::CalResult;
use mems_cal::instrument::registry::StationDevices;
use mems_cal::sensor::{Port, SensorSpec, SpecSource, TomlSpecSource, UnitUnderTest};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mems-cal", version, about = "MEMS inertial sensor calibration station")]
struct Cli {
    /// Station configuration file
    #[arg(long, global = true, default_value = "config/station.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Plain report output without ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate units of one part number
    Run {
        /// Part number; selects `<spec_dir>/<part>.toml`
        part: String,
        /// Unit assignments as `PORT_n=SERIAL`
        #[arg(required = true)]
        units: Vec<String>,
        /// analog, digital or tumble. Defaults from the part's output type.
        #[arg(long)]
        family: Option<TestFamily>,
        /// Use the in-memory station instead of the configured instruments
        #[arg(long)]
        simulate: bool,
    },
    /// Reduce an existing data file
    Analyze {
        /// Per-unit CSV data file
        file: PathBuf,
        #[arg(long)]
        part: String,
        /// Serial number; taken from the file name when omitted
        #[arg(long)]
        serial: Option<String>,
        #[arg(long, default_value = "PORT_1")]
        port: Port,
        #[arg(long)]
        family: Option<TestFamily>,
        /// Also save the JSON report under the data directory
        #[arg(long)]
        save: bool,
    },
    /// Check the board supply rails against their nominal voltages
    BoardCheck {
        #[arg(long)]
        simulate: bool,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn load_spec(config: &StationConfig, part: &str) -> CalResult<SensorSpec> {
    TomlSpecSource::new(&config.application.spec_dir).fetch(part).await
}

fn default_family(spec: &SensorSpec) -> TestFamily {
    if spec.output_type.is_digital() {
        TestFamily::Digital
    } else {
        TestFamily::Analog
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("loading station configuration '{}'", cli.config.display()))?;
    init_logging(&config.application.log_level, cli.json);
    let color = !cli.no_color && std::io::stdout().is_terminal();
    info!("{} on station '{}'", config.application.name, config.application.station_name);

    match cli.command {
        Command::Run {
            part,
            units,
            family,
            simulate,
        } => {
            let spec = load_spec(&config, &part).await?;
            let units = units
                .iter()
                .map(|u| parse_unit_assignment(u, &part))
                .collect::<CalResult<Vec<_>>>()?;
            let family = family.unwrap_or_else(|| default_family(&spec));

            let (station, operator) = if simulate {
                let (devices, world) = StationDevices::simulated(&config, &spec, &units);
                let mut operator = ScriptedOperator::new().on_remount(move |axis| world.set_mounted_axis(axis));
                if let Some(limits) = spec.limits.bandwidth {
                    for unit in &units {
                        operator = operator.with_bandwidth(unit.serial_no.clone(), (limits.low + limits.high) / 2.0);
                    }
                }
                (devices.into_station(&config), Arc::new(operator) as Arc<dyn Operator>)
            } else {
                let devices = StationDevices::connect(&config).await?;
                (devices.into_station(&config), Arc::new(ConsoleOperator::new()) as Arc<dyn Operator>)
            };

            let data_dir = config.application.data_dir.clone();
            let mut orchestrator = CalibrationOrchestrator::new(station, config, spec, units, operator)?;
            let report = orchestrator.run(family).await?;
            println!("{}", report.render(color));
            let path = report.save(&data_dir)?;
            println!("Report saved to {}", path.display());
            Ok(exit_code(report.passed()))
        }
        Command::Analyze {
            file,
            part,
            serial,
            port,
            family,
            save,
        } => {
            let spec = load_spec(&config, &part).await?;
            let records = read_records(&file)?;
            if records.is_empty() {
                bail!("'{}' holds no records", file.display());
            }
            let serial = serial
                .or_else(|| serial_from_file_name(&file))
                .context("no serial number given and none in the file name")?;
            let family = family.unwrap_or_else(|| TestFamily::infer(&spec, &records));
            let unit = UnitUnderTest::new(serial, part.clone(), port);

            let engine = ReductionEngine::new(spec, config.site.local_gravity());
            let reduced = reduce_unit(&engine, family, &unit, &records);
            let mut report = RunReport::new(part, family, config.application.station_name.clone(), vec![unit]);
            report.metrics = reduced.metrics;
            report.finish();
            println!("{}", report.render(color));
            if save {
                let path = report.save(&config.application.data_dir)?;
                println!("Report saved to {}", path.display());
            }
            Ok(exit_code(report.passed()))
        }
        Command::BoardCheck { simulate } => {
            let devices = if simulate {
                StationDevices::simulated_with(&config, BTreeMap::new(), None).0
            } else {
                StationDevices::connect(&config).await?
            };
            let Some(supply) = devices.supply.clone() else {
                bail!("board check needs a power supply; supply.vendor is 'none'");
            };
            let station = devices.into_station(&config);
            let check = run_board_check(&station.scanner, supply.as_ref(), &config.daq, &config.supply.rails).await?;
            for (label, value) in &check.readings {
                println!("{:<12} {:>14.6}", label, value);
            }
            for c in &check.checks {
                println!(
                    "{:<12} {:>14.6}  {:<20} {}",
                    c.name,
                    c.measured,
                    c.limit.to_string(),
                    if c.passed { "PASS" } else { "FAIL" }
                );
            }
            Ok(exit_code(check.passed()))
        }
    }
}

fn exit_code(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
