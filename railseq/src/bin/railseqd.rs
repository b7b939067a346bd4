//! Power-rail sequencing daemon.
//!
//! Brings the board up once, then supervises the rails until terminated.
//! A failed bring-up leaves the board in its safe state and the daemon
//! keeps reporting the fault code until the board is power-cycled.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use railseq::config::BoardConfig;
use railseq::controller::{Controller, Hardware};
use railseq::hw_trait::I2c;
use railseq::sim::SimBoard;
use railseq::tracing::{self, prelude::*};

/// Power-good delay of the simulated rails.
const SIMULATED_RAMP: Duration = Duration::from_millis(5);

#[derive(Debug, Parser)]
#[command(name = "railseqd", version, about = "Power-rail sequencing controller")]
struct Args {
    /// Board configuration file (TOML). Falls back to $RAILSEQ_CONFIG, then
    /// to the built-in reference board.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Run against a simulated board instead of i2c-dev and sysfs GPIO
    #[arg(long)]
    simulate: bool,

    /// Scan the bus before bring-up
    #[arg(long)]
    scan: bool,
}

fn load_config(args: &Args) -> Result<BoardConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| env::var_os("RAILSEQ_CONFIG").map(PathBuf::from));
    match path {
        Some(path) => {
            info!("Loading board configuration from {}", path.display());
            BoardConfig::load_from(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            info!("No configuration given, using the reference board");
            Ok(BoardConfig::default())
        }
    }
}

#[cfg(target_os = "linux")]
async fn open_hardware(config: &BoardConfig) -> Result<Hardware<railseq::hw::I2cDev>> {
    railseq::hw::open(config).await.context("opening board hardware")
}

#[cfg(not(target_os = "linux"))]
async fn open_hardware(_config: &BoardConfig) -> Result<Hardware<railseq::sim::SimI2c>> {
    anyhow::bail!("hardware access needs Linux i2c-dev; use --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();
    let args = Args::parse();
    let config = load_config(&args)?;

    let running = CancellationToken::new();
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let shutdown = running.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        trace!("Shutting down.");
        shutdown.cancel();
    });
    info!("Started.");

    if args.simulate {
        info!("Using simulated board");
        let board = SimBoard::healthy(&config, SIMULATED_RAMP);
        let hardware = board.hardware(&config);
        drive(hardware, config, args.scan, running).await?;
    } else {
        let hardware = open_hardware(&config).await?;
        drive(hardware, config, args.scan, running).await?;
    }

    info!("Exiting.");
    Ok(())
}

async fn drive<I: I2c>(
    hardware: Hardware<I>,
    config: BoardConfig,
    scan: bool,
    running: CancellationToken,
) -> Result<()> {
    let mut controller = Controller::new(hardware, config).await?;
    // Waits out the startup delay itself; a fault is reported again by `run`.
    if scan && controller.scan().await.is_err() {
        warn!("Bus scan aborted");
    }

    // Bring-up runs to completion or to a fault; signals are handled after.
    if controller.run().await.is_ok() {
        supervise(&mut controller, &running).await;
    }

    if let Some(fault) = controller.state().fault() {
        let code = fault.code();
        let period = controller.config().timing.fault_report;
        await_reset(code, period, &running).await;
        anyhow::bail!("exited with the board faulted (code {})", code);
    }
    Ok(())
}

// Supervise the running board until shutdown or a supervisory fault.
async fn supervise<I: I2c>(controller: &mut Controller<I>, running: &CancellationToken) {
    let timing = controller.config().timing.clone();
    let mut poll = time::interval(timing.supervise_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = time::interval(timing.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = running.cancelled() => return,
            _ = heartbeat.tick() => {
                info!("Running, uptime {} s", controller.uptime().as_secs());
            }
            _ = poll.tick() => {
                if controller.supervise().await.is_err() {
                    return;
                }
            }
        }
    }
}

// Faulted is terminal; keep the fault visible until someone resets the board.
async fn await_reset(code: u16, period: Duration, running: &CancellationToken) {
    let mut report = time::interval(period);
    loop {
        tokio::select! {
            _ = running.cancelled() => return,
            _ = report.tick() => {
                error!("Startup aborted (last code {}) - awaiting reset", code);
            }
        }
    }
}
