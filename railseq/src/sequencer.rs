//! Rail sequencer.
//!
//! Programs each PMIC's operating registers and then brings the rails up
//! stage by stage: a stage's enables are asserted together, allowed to
//! settle, and every rail in the stage must report a debounced power-good
//! before the next stage starts. The global power-good output is asserted
//! only once the last stage has confirmed.
//!
//! The sequencer owns every output pin on the board, so nothing outside the
//! controller can drive an enable line.

use tokio::time::{self, Instant};

use crate::config::{PmicDescriptor, RailConfig, TimingConfig};
use crate::controller::SequencingState;
use crate::error::{Error, Fault, Result};
use crate::hw_trait::{I2c, InputPin, OutputPin};
use crate::peripheral::tps6287x::{self, Register, VRange};
use crate::tracing::prelude::*;
use crate::transaction::Bus;

/// Write the operating registers of `pmic`, CONTROL1 first and VSET last.
pub async fn program<I: I2c>(
    bus: &mut Bus<I>,
    pmic: &PmicDescriptor,
    slot: usize,
) -> std::result::Result<(), Fault> {
    let targets = &pmic.targets;
    info!(
        "Programming {} PMIC: {} mV ({})",
        pmic.name,
        tps6287x::vset_to_millivolts(targets.vset, targets.control2),
        VRange::from_control2(targets.control2),
    );
    debug!(
        "{} CONTROL1 0x{:02X}: {}",
        pmic.name,
        targets.control1,
        tps6287x::describe_control1(targets.control1).join(", ")
    );

    let writes = [
        (Register::Control1, targets.control1),
        (Register::Control2, targets.control2),
        (Register::Control3, targets.control3),
        (Register::Vset, targets.vset),
    ];
    for (register, value) in writes {
        if let Err(error) = bus.write(pmic.address, register.offset(), &[value]).await {
            return Err(Fault::ProgramFailed {
                pmic: pmic.name.clone(),
                slot,
                register,
                error,
            });
        }
        trace!("{} {} <- 0x{:02X}", pmic.name, register, value);
    }
    Ok(())
}

struct Rail {
    name: String,
    stage: u8,
    enable: Box<dyn OutputPin>,
    power_good: Option<Box<dyn InputPin>>,
    enabled: bool,
    /// Consecutive deasserted samples seen while supervising.
    low_samples: u32,
}

/// Owner of the enable, power-good and status lines.
pub struct RailSequencer {
    rails: Vec<Rail>,
    global_power_good: Box<dyn OutputPin>,
    fault_indicator: Option<Box<dyn OutputPin>>,
    /// Rail indices in the order they were enabled.
    enable_order: Vec<usize>,
}

impl RailSequencer {
    /// Pair each configured rail with its pins. `enables` and `power_good`
    /// are indexed like `rails`.
    pub fn new(
        rails: &[RailConfig],
        enables: Vec<Box<dyn OutputPin>>,
        power_good: Vec<Option<Box<dyn InputPin>>>,
        global_power_good: Box<dyn OutputPin>,
        fault_indicator: Option<Box<dyn OutputPin>>,
    ) -> Result<Self> {
        if enables.len() != rails.len() || power_good.len() != rails.len() {
            return Err(Error::Config(format!(
                "{} rails configured but {} enable and {} power-good pins supplied",
                rails.len(),
                enables.len(),
                power_good.len()
            )));
        }

        let rails = rails
            .iter()
            .zip(enables)
            .zip(power_good)
            .map(|((config, enable), power_good)| Rail {
                name: config.name.clone(),
                stage: config.stage,
                enable,
                power_good,
                enabled: false,
                low_samples: 0,
            })
            .collect();

        Ok(Self {
            rails,
            global_power_good,
            fault_indicator,
            enable_order: Vec::new(),
        })
    }

    /// Distinct stages in ascending order.
    pub fn stages(&self) -> Vec<u8> {
        let mut stages: Vec<u8> = self.rails.iter().map(|r| r.stage).collect();
        stages.sort_unstable();
        stages.dedup();
        stages
    }

    /// Names of the rails currently enabled, in enable order.
    pub fn enabled_rails(&self) -> Vec<&str> {
        self.enable_order.iter().map(|&i| self.rails[i].name.as_str()).collect()
    }

    /// Drive every output to its inactive level.
    pub async fn deassert_all(&mut self) -> std::result::Result<(), Fault> {
        for rail in &mut self.rails {
            rail.enable.set(false).await?;
            rail.enabled = false;
        }
        self.enable_order.clear();
        self.global_power_good.set(false).await?;
        if let Some(indicator) = &mut self.fault_indicator {
            indicator.set(false).await?;
        }
        Ok(())
    }

    /// Enable the rails stage by stage, confirming power-good after each.
    ///
    /// Leaves `state` at `Running` on success. Does nothing when `state` is
    /// already faulted.
    pub async fn sequence(
        &mut self,
        timing: &TimingConfig,
        state: &mut SequencingState,
    ) -> std::result::Result<(), Fault> {
        if let Some(fault) = state.fault() {
            return Err(fault.clone());
        }

        let started = Instant::now();
        for stage in self.stages() {
            state.advance(SequencingState::EnablingStage(stage));
            let members: Vec<usize> = (0..self.rails.len())
                .filter(|&i| self.rails[i].stage == stage)
                .collect();

            for &index in &members {
                let rail = &mut self.rails[index];
                rail.enable.set(true).await?;
                rail.enabled = true;
                self.enable_order.push(index);
                info!("{} rail enabled", rail.name);
            }

            time::sleep(timing.rail_settle).await;
            let deadline = Instant::now() + timing.power_good_timeout;
            for &index in &members {
                self.confirm_power_good(index, deadline, timing).await?;
            }
        }

        self.global_power_good.set(true).await?;
        state.advance(SequencingState::Running);
        info!("Power good, all rails up after {} ms", started.elapsed().as_millis());
        Ok(())
    }

    // Poll until `power_good_samples` consecutive asserted samples, or fail at `deadline`.
    async fn confirm_power_good(
        &mut self,
        index: usize,
        deadline: Instant,
        timing: &TimingConfig,
    ) -> std::result::Result<(), Fault> {
        let waiting_since = Instant::now();
        let rail = &mut self.rails[index];
        let Some(power_good) = rail.power_good.as_mut() else {
            warn!("{} rail has no power-good input, accepted after settle", rail.name);
            return Ok(());
        };

        let mut streak = 0;
        loop {
            if power_good.is_high().await? {
                streak += 1;
                if streak >= timing.power_good_samples {
                    info!(
                        "{} rail power good ({} ms after settle)",
                        rail.name,
                        waiting_since.elapsed().as_millis()
                    );
                    return Ok(());
                }
            } else {
                streak = 0;
            }
            if Instant::now() >= deadline {
                return Err(Fault::PowerGoodTimeout {
                    rail: rail.name.clone(),
                    index,
                    timeout_ms: timing.power_good_timeout.as_millis() as u64,
                });
            }
            time::sleep(timing.power_good_poll).await;
        }
    }

    /// Take one power-good sample from every enabled rail.
    ///
    /// A rail that reads deasserted on `power_good_samples` consecutive calls
    /// is reported as lost.
    pub async fn supervise(&mut self, timing: &TimingConfig) -> std::result::Result<(), Fault> {
        for (index, rail) in self.rails.iter_mut().enumerate() {
            if !rail.enabled {
                continue;
            }
            let Some(power_good) = rail.power_good.as_mut() else {
                continue;
            };
            if power_good.is_high().await? {
                rail.low_samples = 0;
                continue;
            }
            rail.low_samples += 1;
            debug!("{} rail power-good low ({} samples)", rail.name, rail.low_samples);
            if rail.low_samples >= timing.power_good_samples {
                return Err(Fault::PowerGoodLost {
                    rail: rail.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }

    /// Signal a fault on the outputs.
    ///
    /// Deasserts global power-good, asserts the fault indicator and, with
    /// `shutdown` set, switches the enabled rails off in reverse enable
    /// order. Pin failures are logged and do not stop the remaining steps.
    pub async fn fail_safe(&mut self, shutdown: bool) {
        if let Err(e) = self.global_power_good.set(false).await {
            error!("Failed to deassert power good: {}", e);
        }
        if let Some(indicator) = &mut self.fault_indicator {
            if let Err(e) = indicator.set(true).await {
                error!("Failed to assert fault indicator: {}", e);
            }
        }
        if !shutdown {
            return;
        }
        while let Some(index) = self.enable_order.pop() {
            let rail = &mut self.rails[index];
            match rail.enable.set(false).await {
                Ok(()) => {
                    rail.enabled = false;
                    info!("{} rail disabled", rail.name);
                }
                Err(e) => error!("Failed to disable {} rail: {}", rail.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::BoardConfig;
    use crate::sim::SimBoard;
    use crate::transaction::BusConfig;

    const PG_DELAY: Duration = Duration::from_millis(5);

    fn sequencer_for(board: &SimBoard, config: &BoardConfig) -> RailSequencer {
        let hw = board.hardware(config);
        RailSequencer::new(
            &config.rails,
            hw.enables,
            hw.power_good,
            hw.global_power_good,
            hw.fault_indicator,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_writes_control1_first_and_vset_last() {
        let config = BoardConfig::default();
        let board = SimBoard::healthy(&config, PG_DELAY);
        let mut bus = Bus::open(board.i2c(), BusConfig::default()).await.unwrap();

        program(&mut bus, &config.pmics[0], 0).await.unwrap();
        assert_eq!(
            board.writes_to(0x42),
            vec![vec![0x01, 0x68], vec![0x02, 0x0D], vec![0x03, 0x02], vec![0x00, 0xFA]]
        );
        assert_eq!(board.register(0x42, Register::Vset), Some(0xFA));
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_failure_names_register() {
        let config = BoardConfig::default();
        let board = SimBoard::new();
        let mut bus = Bus::open(board.i2c(), BusConfig::default()).await.unwrap();

        let fault = program(&mut bus, &config.pmics[1], 1).await.unwrap_err();
        assert!(matches!(fault, Fault::ProgramFailed { register: Register::Control1, .. }));
        assert_eq!(fault.code(), 211);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_enable_in_order() {
        let config = BoardConfig::default();
        let board = SimBoard::healthy(&config, PG_DELAY);
        let mut sequencer = sequencer_for(&board, &config);
        let mut state = SequencingState::Programming;

        sequencer.sequence(&config.timing, &mut state).await.unwrap();
        assert_eq!(state, SequencingState::Running);
        assert_eq!(board.asserted_order(), vec![8, 10, 14, 15, 12, 0]);
        assert!(board.level(0));
        assert_eq!(sequencer.enabled_rails(), vec!["1V0", "1V8", "1V2_GTX", "1V8_GTX", "3V3"]);

        // stage 2 waits for stage 1's settle and confirmation
        let stage1 = board.first_asserted(8).unwrap();
        let stage2 = board.first_asserted(10).unwrap();
        assert!(stage2 - stage1 >= config.timing.rail_settle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_good_timeout_stops_sequence() {
        let config = BoardConfig::default();
        let board = SimBoard::healthy(&config, PG_DELAY);
        board.link_power_good(10, 3, None);
        let mut sequencer = sequencer_for(&board, &config);
        let mut state = SequencingState::Programming;

        let start = Instant::now();
        let fault = sequencer.sequence(&config.timing, &mut state).await.unwrap_err();
        assert_eq!(
            fault,
            Fault::PowerGoodTimeout { rail: "1V8".into(), index: 1, timeout_ms: 500 }
        );
        assert_eq!(state, SequencingState::EnablingStage(2));
        let timing = &config.timing;
        assert!(start.elapsed() >= timing.rail_settle * 2 + timing.power_good_timeout);
        assert_eq!(board.first_asserted(12), None);
        assert!(!board.level(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_glitching_power_good_is_debounced() {
        let mut config = BoardConfig::default();
        config.rails.truncate(1);
        let board = SimBoard::healthy(&config, PG_DELAY);
        let mut sequencer = sequencer_for(&board, &config);
        let mut state = SequencingState::Programming;
        sequencer.sequence(&config.timing, &mut state).await.unwrap();

        // fewer low samples than the debounce count are tolerated
        board.force_power_good(2, Some(false));
        for _ in 1..config.timing.power_good_samples {
            sequencer.supervise(&config.timing).await.unwrap();
        }
        board.force_power_good(2, None);
        sequencer.supervise(&config.timing).await.unwrap();

        board.force_power_good(2, Some(false));
        let mut result = Ok(());
        for _ in 0..config.timing.power_good_samples {
            result = sequencer.supervise(&config.timing).await;
        }
        assert_eq!(result, Err(Fault::PowerGoodLost { rail: "1V0".into(), index: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_safe_disables_in_reverse_order() {
        let mut config = BoardConfig::default();
        config.gpio.fault_indicator = Some(1);
        let board = SimBoard::healthy(&config, PG_DELAY);
        let mut sequencer = sequencer_for(&board, &config);
        let mut state = SequencingState::Programming;
        sequencer.sequence(&config.timing, &mut state).await.unwrap();

        sequencer.fail_safe(true).await;
        let lowered: Vec<u32> = board
            .events()
            .iter()
            .filter(|e| !e.high && e.pin != 0)
            .map(|e| e.pin)
            .collect();
        assert_eq!(lowered, vec![12, 15, 14, 10, 8]);
        assert!(!board.level(0));
        assert!(board.level(1));
        assert!(sequencer.enabled_rails().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_state_blocks_sequence() {
        let config = BoardConfig::default();
        let board = SimBoard::healthy(&config, PG_DELAY);
        let mut sequencer = sequencer_for(&board, &config);
        let fault = Fault::PowerGoodLost { rail: "1V0".into(), index: 0 };
        let mut state = SequencingState::Faulted(fault.clone());

        assert_eq!(sequencer.sequence(&config.timing, &mut state).await, Err(fault));
        assert!(board.events().is_empty());
    }
}
