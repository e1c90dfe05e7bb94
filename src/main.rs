//! Command-line front end for the piezo scanner.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use piezo_scan::adapters::{CommandLink, MockAdapter, SerialAdapter};
use piezo_scan::axis::Axis;
use piezo_scan::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use piezo_scan::logging;
use piezo_scan::scan::{FrameRequest, LineMode, ScanEngine, ScanPattern, ScanRange};
use piezo_scan::stage::PiezoStage;
use piezo_scan::trigger::LogTrigger;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "piezo_scan", version, about = "Voltage-domain raster scans on a three-axis piezo stage")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Talk to a simulated controller instead of the serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the controller identity and the calibration of every axis
    Info,
    /// Set one axis to a voltage
    Move {
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        #[arg(long, allow_hyphen_values = true)]
        voltage: f64,
    },
    /// Read the output voltage (or the servo position) of one axis
    Read {
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        #[arg(long)]
        servo: bool,
    },
    /// Scan a list of voltages on one axis
    Line {
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        /// Comma-separated voltages, scanned in order
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        positions: Vec<f64>,
        /// Dwell per sample in seconds
        #[arg(long, default_value_t = 0.1)]
        dwell: f64,
        /// Synchronous pixel pulses with a read-back after every sample
        #[arg(long)]
        verified: bool,
    },
    /// Scan a frame and print the sampled coordinates as JSON
    Frame {
        /// Fast axis as start,stop,step
        #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
        x: ScanRange,
        /// Slow axis as start,stop,step
        #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
        y: ScanRange,
        /// Dwell per sample in seconds
        #[arg(long, default_value_t = 0.1)]
        dwell: f64,
        #[arg(long, value_enum, default_value_t = PatternArg::Raster)]
        pattern: PatternArg,
        #[arg(long)]
        verified: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PatternArg {
    Raster,
    Boustrophedon,
}

impl From<PatternArg> for ScanPattern {
    fn from(arg: PatternArg) -> Self {
        match arg {
            PatternArg::Raster => ScanPattern::Raster,
            PatternArg::Boustrophedon => ScanPattern::Boustrophedon,
        }
    }
}

fn parse_axis(s: &str) -> Result<Axis, String> {
    let id: u8 = s
        .parse()
        .map_err(|_| format!("'{}' is not a channel number", s))?;
    Axis::try_from(id).map_err(|e| e.to_string())
}

fn parse_range(s: &str) -> Result<ScanRange, String> {
    s.parse::<ScanRange>().map_err(|e| e.to_string())
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid dwell time {} s", value))
}

fn line_mode(verified: bool) -> LineMode {
    if verified {
        LineMode::Verified
    } else {
        LineMode::Standard
    }
}

async fn open_link(config: &ScanConfig, simulate: bool) -> Result<Box<dyn CommandLink>> {
    if simulate {
        info!("using simulated controller");
        return Ok(Box::new(MockAdapter::new()));
    }

    let mut adapter = SerialAdapter::from_config(&config.serial);
    adapter
        .connect()
        .await
        .with_context(|| format!("opening {}", adapter.port_name()))?;
    info!(port = adapter.port_name(), baud = adapter.baud_rate(), "serial link open");
    Ok(Box::new(adapter))
}

async fn run(
    engine: &mut ScanEngine<Box<dyn CommandLink>, LogTrigger>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Info => {
            let stage = engine.stage_mut();
            println!("{}", stage.identify().await?);
            for axis in Axis::ALL {
                let cal = stage.calibration(axis).await?;
                println!(
                    "axis {}: {} .. {} V, offset {} V",
                    axis, cal.volt_min, cal.volt_max, cal.volt_offset
                );
            }
        }
        Command::Move { axis, voltage } => {
            engine.stage_mut().command_voltage(axis, voltage).await?;
            info!(%axis, voltage, "moved");
        }
        Command::Read { axis, servo } => {
            let stage = engine.stage_mut();
            let value = if servo {
                stage.read_servo_position(axis).await?
            } else {
                stage.read_voltage(axis).await?
            };
            println!("{}", value);
        }
        Command::Line {
            axis,
            positions,
            dwell,
            verified,
        } => {
            let report = engine
                .scan_line(axis, &positions, seconds(dwell)?, line_mode(verified))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Frame {
            x,
            y,
            dwell,
            pattern,
            verified,
        } => {
            let request = FrameRequest::new(x, y, seconds(dwell)?)
                .with_pattern(pattern.into())
                .with_mode(line_mode(verified));
            let result = engine.scan_frame(&request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ScanConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.application)?;

    let link = open_link(&config, cli.simulate).await?;
    let mut stage = PiezoStage::new(link);
    stage.initialize().await.context("initialising controller")?;

    let mut engine = ScanEngine::from_config(stage, LogTrigger, &config);
    engine.reset_triggers().await?;

    let outcome = run(&mut engine, cli.command).await;

    if let Err(e) = engine.stage_mut().close().await {
        warn!(error = %e, "failed to return controller to local control");
    }
    outcome
}
