//! Bring-up state machine.
//!
//! The [`Controller`] owns the bus and every board pin and walks the board
//! from power-on to `Running`:
//!
//! 1. Deassert every output and wait out the startup delay.
//! 2. Verify each PMIC in device-map order. If any fails, broadcast a reset
//!    to all of them and verify once more; a second failure is fatal.
//! 3. Program each PMIC's operating registers.
//! 4. Hand over to the [`RailSequencer`] for the staged enables.
//!
//! Any fault moves the controller to [`SequencingState::Faulted`], which is
//! terminal: outputs are put in their safe state and nothing further is
//! attempted until the board is power-cycled.

use std::fmt;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::config::BoardConfig;
use crate::error::{Fault, Result};
use crate::hw_trait::{I2c, InputPin, OutputPin};
use crate::peripheral::tps6287x::{self, Register};
use crate::scan::{self, ScanReport};
use crate::sequencer::{self, RailSequencer};
use crate::tracing::prelude::*;
use crate::transaction::Bus;
use crate::verify;

/// Every hardware handle the controller takes ownership of.
///
/// `enables` and `power_good` are indexed like the configured rails.
pub struct Hardware<I> {
    pub i2c: I,
    pub enables: Vec<Box<dyn OutputPin>>,
    pub power_good: Vec<Option<Box<dyn InputPin>>>,
    pub global_power_good: Box<dyn OutputPin>,
    pub fault_indicator: Option<Box<dyn OutputPin>>,
}

/// Where the board is in its bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencingState {
    Idle,
    Verifying,
    Resetting,
    Programming,
    /// Enabling the rails of the given stage.
    EnablingStage(u8),
    Running,
    Faulted(Fault),
}

impl SequencingState {
    /// Move to `next`. A faulted state is never left; returns whether the
    /// transition happened.
    pub fn advance(&mut self, next: SequencingState) -> bool {
        if self.is_faulted() {
            return false;
        }
        debug!("State {} -> {}", self, next);
        *self = next;
        true
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, SequencingState::Faulted(_))
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            SequencingState::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for SequencingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencingState::Idle => write!(f, "idle"),
            SequencingState::Verifying => write!(f, "verifying"),
            SequencingState::Resetting => write!(f, "resetting"),
            SequencingState::Programming => write!(f, "programming"),
            SequencingState::EnablingStage(stage) => write!(f, "enabling stage {}", stage),
            SequencingState::Running => write!(f, "running"),
            SequencingState::Faulted(fault) => write!(f, "faulted (code {})", fault.code()),
        }
    }
}

/// Count of whole-board reset-and-retry cycles spent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter(u8);

impl RetryCounter {
    /// Resets allowed per boot.
    pub const LIMIT: u8 = 1;

    pub fn exhausted(&self) -> bool {
        self.0 >= Self::LIMIT
    }

    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn count(&self) -> u8 {
        self.0
    }
}

pub struct Controller<I> {
    bus: Bus<I>,
    config: BoardConfig,
    sequencer: RailSequencer,
    state: SequencingState,
    retries: RetryCounter,
    started: Instant,
    /// Outputs deasserted and the startup delay served.
    settled: bool,
}

impl<I: I2c> Controller<I> {
    /// Validate `config`, take ownership of the hardware and open the bus.
    pub async fn new(hardware: Hardware<I>, config: BoardConfig) -> Result<Self> {
        config.validate()?;
        let sequencer = RailSequencer::new(
            &config.rails,
            hardware.enables,
            hardware.power_good,
            hardware.global_power_good,
            hardware.fault_indicator,
        )?;
        let bus = Bus::open(hardware.i2c, config.bus.bus_config()).await?;

        Ok(Self {
            bus,
            config,
            sequencer,
            state: SequencingState::Idle,
            retries: RetryCounter::default(),
            started: Instant::now(),
            settled: false,
        })
    }

    pub fn state(&self) -> &SequencingState {
        &self.state
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Reset broadcasts issued so far.
    pub fn resets_issued(&self) -> u8 {
        self.retries.count()
    }

    /// Time since the controller took the hardware.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run the bus diagnostics. Rail state is not touched.
    ///
    /// Before bring-up this first drives the outputs to their safe levels and
    /// waits out the startup delay, the same as [`Controller::run`] would, so
    /// no transaction reaches a PMIC early. A failure to do so faults the
    /// controller.
    pub async fn scan(&mut self) -> std::result::Result<ScanReport, Fault> {
        if let Some(fault) = self.state.fault() {
            return Err(fault.clone());
        }
        if let Err(fault) = self.settle().await {
            self.enter_fault(fault.clone()).await;
            return Err(fault);
        }
        Ok(scan::scan(&mut self.bus, self.config.timing.probe_settle).await)
    }

    /// Bring the board up from `Idle` to `Running`.
    ///
    /// On failure the controller is left `Faulted` with its outputs in the
    /// safe state, and the fault is returned. Calling this again once faulted
    /// returns the same fault without touching the hardware.
    pub async fn run(&mut self) -> std::result::Result<(), Fault> {
        match &self.state {
            SequencingState::Idle => {}
            SequencingState::Faulted(fault) => return Err(fault.clone()),
            state => {
                warn!("Bring-up already done (state {})", state);
                return Ok(());
            }
        }

        let result = self.bring_up().await;
        if let Err(fault) = &result {
            self.enter_fault(fault.clone()).await;
        }
        result
    }

    // Outputs low, then the startup delay. Done once, before the first
    // transaction.
    async fn settle(&mut self) -> std::result::Result<(), Fault> {
        if self.settled {
            return Ok(());
        }
        let delay = self.config.timing.startup_delay;
        self.sequencer.deassert_all().await?;
        info!("Waiting {} ms for supplies to settle", delay.as_millis());
        time::sleep(delay).await;
        self.settled = true;
        Ok(())
    }

    async fn bring_up(&mut self) -> std::result::Result<(), Fault> {
        let timing = self.config.timing.clone();
        self.settle().await?;

        self.verify_board().await?;

        self.state.advance(SequencingState::Programming);
        for (slot, pmic) in self.config.pmics.iter().enumerate() {
            sequencer::program(&mut self.bus, pmic, slot).await?;
            time::sleep(timing.program_settle).await;
        }

        time::sleep(timing.pre_sequence_delay).await;
        self.sequencer.sequence(&timing, &mut self.state).await?;
        info!("Bring-up complete after {} ms", self.uptime().as_millis());
        Ok(())
    }

    // Verification passes with the single whole-board reset in between.
    async fn verify_board(&mut self) -> std::result::Result<(), Fault> {
        loop {
            self.state.advance(SequencingState::Verifying);

            // every device is checked; the last failure decides
            let mut failure = None;
            for (slot, pmic) in self.config.pmics.iter().enumerate() {
                let outcome = verify::verify(&mut self.bus, pmic).await;
                match outcome.fault(pmic, slot) {
                    None => info!("{} PMIC verified", pmic.name),
                    Some(fault) => {
                        warn!("{} (code {})", fault, fault.code());
                        failure = Some(fault);
                    }
                }
                time::sleep(self.config.timing.verify_delay).await;
            }

            let Some(fault) = failure else {
                return Ok(());
            };
            if self.retries.exhausted() {
                return Err(fault);
            }
            self.retries.increment();
            self.state.advance(SequencingState::Resetting);
            self.reset_all().await;
        }
    }

    // Reset every configured PMIC, whichever ones failed.
    async fn reset_all(&mut self) {
        info!("Resetting all PMICs");
        for pmic in &self.config.pmics {
            let command = tps6287x::reset_command(pmic.defaults.control1);
            match self.bus.write(pmic.address, Register::Control1.offset(), &[command]).await {
                Ok(_) => debug!("{} PMIC reset (CONTROL1 <- 0x{:02X})", pmic.name, command),
                Err(e) => {
                    warn!("{} PMIC reset write failed: {} (code {})", pmic.name, e, e.code())
                }
            }
        }
    }

    /// Check the enabled rails once. Call every `supervise_interval` while
    /// running; a lost rail faults the controller.
    pub async fn supervise(&mut self) -> std::result::Result<(), Fault> {
        match &self.state {
            SequencingState::Running => {}
            SequencingState::Faulted(fault) => return Err(fault.clone()),
            _ => return Ok(()),
        }

        let result = self.sequencer.supervise(&self.config.timing).await;
        if let Err(fault) = &result {
            self.enter_fault(fault.clone()).await;
        }
        result
    }

    async fn enter_fault(&mut self, fault: Fault) {
        error!("Startup aborted: {} (code {})", fault, fault.code());
        self.state.advance(SequencingState::Faulted(fault));
        self.sequencer.fail_safe(self.config.gpio.shutdown_on_fault).await;
        let still_on = self.sequencer.enabled_rails();
        if !still_on.is_empty() {
            warn!("Rails left enabled: {}", still_on.join(", "));
        }
    }
}
