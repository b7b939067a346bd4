//! Standalone I2C bus scan.
//!
//! Opens only the bus, never the GPIO lines, so it is safe to run on a live
//! board. Prints an i2cdetect-style map, or the full report with `--json`.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use railseq::config::BoardConfig;
use railseq::hw_trait::I2c;
use railseq::scan::{self, Probe, ScanReport};
use railseq::sim::SimBoard;
use railseq::tracing;
use railseq::transaction::Bus;

#[derive(Debug, Parser)]
#[command(name = "railseq-scan", version, about = "Scan the PMIC bus for devices")]
struct Args {
    /// Board configuration file (TOML). Falls back to $RAILSEQ_CONFIG, then
    /// to the built-in reference board.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// i2c-dev node to scan, overriding the configuration
    #[arg(long, short)]
    device: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Scan the simulated reference board
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing::init_journald_or_stdout();
    let args = Args::parse();

    let path = args
        .config
        .clone()
        .or_else(|| env::var_os("RAILSEQ_CONFIG").map(PathBuf::from));
    let mut config = match &path {
        Some(path) => BoardConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BoardConfig::default(),
    };
    if let Some(device) = args.device.clone() {
        config.bus.device = device;
    }

    let report = if args.simulate {
        let board = SimBoard::healthy(&config, std::time::Duration::ZERO);
        run_scan(board.i2c(), &config).await?
    } else {
        scan_hardware(&config).await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_map(&report);
    }

    Ok(if report.any_found() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(target_os = "linux")]
async fn scan_hardware(config: &BoardConfig) -> Result<ScanReport> {
    let bus = config.bus.bus_config();
    let i2c = railseq::hw::I2cDev::open(&config.bus.device, bus.timeout)
        .with_context(|| format!("opening {}", config.bus.device.display()))?;
    run_scan(i2c, config).await
}

#[cfg(not(target_os = "linux"))]
async fn scan_hardware(_config: &BoardConfig) -> Result<ScanReport> {
    anyhow::bail!("hardware access needs Linux i2c-dev; use --simulate")
}

async fn run_scan<I: I2c>(i2c: I, config: &BoardConfig) -> Result<ScanReport> {
    let mut bus = Bus::open(i2c, config.bus.bus_config()).await?;
    Ok(scan::scan(&mut bus, config.timing.probe_settle).await)
}

// 16 addresses per row: the address if found, "--" if not acknowledged,
// "RE" for a failed data phase, "TO" for a timeout.
fn print_map(report: &ScanReport) {
    println!("     {}", (0..16).map(|c| format!("{:2x}", c)).collect::<Vec<_>>().join(" "));
    for row in report.results.chunks(16) {
        let cells: Vec<String> = row
            .iter()
            .map(|r| match r.probe {
                Probe::Found => format!("{:02x}", r.address),
                Probe::WriteError => "--".into(),
                Probe::ReadError => "RE".into(),
                Probe::NoResponse => "TO".into(),
            })
            .collect();
        println!("{:02x}:  {}", row[0].address, cells.join(" "));
    }
}
