//! Simulated board.
//!
//! A [`SimBoard`] models the I2C bus with TPS6287x register files behind it
//! and the GPIO lines around them: enable outputs, power-good inputs that
//! follow their rail's enable after a delay, and the global power-good
//! output. All handles share one state, so a test can keep the board,
//! hand the pins to a controller, and inspect transfers and pin events
//! afterwards. The daemon uses the same board for `--simulate`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::BoardConfig;
use crate::controller::Hardware;
use crate::hw_trait::{GpioError, I2c, InputPin, OutputPin, TransportError};
use crate::peripheral::tps6287x::{self, Control1, Register, WINDOW_LEN};

/// How a simulated PMIC misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Normal,
    /// ACKs its address, then fails every data read.
    FailingReads,
    /// Holds the bus forever.
    Hung,
    /// Takes the register offset, then never answers the data phase.
    HungReads,
    /// Returns at most this many bytes per read.
    ShortReads(usize),
}

/// One simulated TPS6287x.
#[derive(Debug, Clone)]
pub struct SimPmic {
    regs: [u8; WINDOW_LEN],
    /// Values that come back even after a reset.
    stuck: Vec<(Register, u8)>,
    pointer: u8,
    behaviour: Behaviour,
    resets: u32,
}

impl SimPmic {
    /// A device fresh out of power-on reset.
    pub fn tps6287x() -> Self {
        Self {
            regs: Self::power_on_regs(),
            stuck: Vec::new(),
            pointer: 0,
            behaviour: Behaviour::Normal,
            resets: 0,
        }
    }

    fn power_on_regs() -> [u8; WINDOW_LEN] {
        [
            0x00,
            tps6287x::defaults::CONTROL1,
            tps6287x::defaults::CONTROL2,
            tps6287x::defaults::CONTROL3,
            tps6287x::defaults::STATUS,
        ]
    }

    /// Start with `register` at `value`; a reset restores the default.
    pub fn with_register(mut self, register: Register, value: u8) -> Self {
        self.regs[register.offset() as usize] = value;
        self
    }

    /// Keep `register` at `value` across resets.
    pub fn stuck(mut self, register: Register, value: u8) -> Self {
        self.stuck.push((register, value));
        self.regs[register.offset() as usize] = value;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.behaviour = Behaviour::FailingReads;
        self
    }

    pub fn hung(mut self) -> Self {
        self.behaviour = Behaviour::Hung;
        self
    }

    pub fn hung_reads(mut self) -> Self {
        self.behaviour = Behaviour::HungReads;
        self
    }

    pub fn short_reads(mut self, len: usize) -> Self {
        self.behaviour = Behaviour::ShortReads(len);
        self
    }

    fn reset(&mut self) {
        self.regs = Self::power_on_regs();
        for (register, value) in &self.stuck {
            self.regs[register.offset() as usize] = *value;
        }
        self.resets += 1;
    }

    fn write_registers(&mut self, offset: u8, data: &[u8]) {
        for (i, &value) in data.iter().enumerate() {
            let index = offset as usize + i;
            if index == Register::Control1.offset() as usize
                && Control1::from_bits_retain(value).contains(Control1::RESET)
            {
                self.reset();
            } else if index < WINDOW_LEN {
                self.regs[index] = value;
            }
        }
    }

    fn read_registers(&mut self, buffer: &mut [u8]) {
        let status = Register::Status.offset() as usize;
        for (i, byte) in buffer.iter_mut().enumerate() {
            let index = self.pointer as usize + i;
            *byte = self.regs.get(index).copied().unwrap_or(0);
            if index == status {
                self.regs[status] = 0;
            }
        }
    }
}

/// One transfer seen on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub address: u8,
    pub read: bool,
    pub bytes: Vec<u8>,
    pub at: Instant,
}

/// A level change on a simulated output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub pin: u32,
    pub high: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PowerGoodSource {
    enable_pin: u32,
    /// None: never reaches power-good.
    delay: Option<Duration>,
    forced: Option<bool>,
}

#[derive(Default)]
struct Inner {
    frequency: Option<u32>,
    pmics: HashMap<u8, SimPmic>,
    transfers: Vec<Transfer>,
    levels: HashMap<u32, (bool, Instant)>,
    events: Vec<PinEvent>,
    power_good: HashMap<u32, PowerGoodSource>,
}

impl Inner {
    fn power_good_level(&self, pin: u32) -> bool {
        let Some(source) = self.power_good.get(&pin) else {
            return false;
        };
        if let Some(forced) = source.forced {
            return forced;
        }
        match (self.levels.get(&source.enable_pin), source.delay) {
            (Some((true, since)), Some(delay)) => since.elapsed() >= delay,
            _ => false,
        }
    }
}

/// Shared handle to the simulated board.
#[derive(Clone, Default)]
pub struct SimBoard {
    inner: Arc<Mutex<Inner>>,
}

impl SimBoard {
    /// An empty bus with no pins wired.
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy board matching `config`: every PMIC at its power-on
    /// defaults and every power-good input following its enable after
    /// `power_good_delay`.
    pub fn healthy(config: &BoardConfig, power_good_delay: Duration) -> Self {
        let board = Self::new();
        for pmic in &config.pmics {
            board.add_pmic(pmic.address, SimPmic::tps6287x());
        }
        for rail in &config.rails {
            if let Some(pg) = rail.power_good {
                board.link_power_good(rail.enable, pg, Some(power_good_delay));
            }
        }
        board
    }

    /// Attach `pmic` at `address`, replacing any device already there.
    pub fn add_pmic(&self, address: u8, pmic: SimPmic) {
        self.inner.lock().pmics.insert(address, pmic);
    }

    /// Remove the device at `address` so it stops acknowledging.
    pub fn remove_pmic(&self, address: u8) {
        self.inner.lock().pmics.remove(&address);
    }

    /// Make `pg_pin` follow `enable_pin`, asserting `delay` after the enable
    /// goes high. `None` models a rail that never comes up.
    pub fn link_power_good(&self, enable_pin: u32, pg_pin: u32, delay: Option<Duration>) {
        self.inner.lock().power_good.insert(
            pg_pin,
            PowerGoodSource {
                enable_pin,
                delay,
                forced: None,
            },
        );
    }

    /// Override a power-good input regardless of its rail.
    pub fn force_power_good(&self, pg_pin: u32, level: Option<bool>) {
        if let Some(source) = self.inner.lock().power_good.get_mut(&pg_pin) {
            source.forced = level;
        }
    }

    /// The I2C side of the board.
    pub fn i2c(&self) -> SimI2c {
        SimI2c {
            board: self.clone(),
        }
    }

    pub fn output(&self, pin: u32) -> SimOutput {
        SimOutput {
            board: self.clone(),
            pin,
        }
    }

    pub fn input(&self, pin: u32) -> SimInput {
        SimInput {
            board: self.clone(),
            pin,
        }
    }

    /// Every handle the controller needs for `config`.
    pub fn hardware(&self, config: &BoardConfig) -> Hardware<SimI2c> {
        Hardware {
            i2c: self.i2c(),
            enables: config
                .rails
                .iter()
                .map(|rail| Box::new(self.output(rail.enable)) as Box<dyn OutputPin>)
                .collect(),
            power_good: config
                .rails
                .iter()
                .map(|rail| {
                    rail.power_good
                        .map(|pin| Box::new(self.input(pin)) as Box<dyn InputPin>)
                })
                .collect(),
            global_power_good: Box::new(self.output(config.gpio.power_good_output)),
            fault_indicator: config
                .gpio
                .fault_indicator
                .map(|pin| Box::new(self.output(pin)) as Box<dyn OutputPin>),
        }
    }

    pub fn frequency(&self) -> Option<u32> {
        self.inner.lock().frequency
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.lock().transfers.clone()
    }

    /// Register writes (not offset-only writes) sent to `address`.
    pub fn writes_to(&self, address: u8) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .transfers
            .iter()
            .filter(|t| t.address == address && !t.read && t.bytes.len() > 1)
            .map(|t| t.bytes.clone())
            .collect()
    }

    pub fn register(&self, address: u8, register: Register) -> Option<u8> {
        self.inner
            .lock()
            .pmics
            .get(&address)
            .map(|p| p.regs[register.offset() as usize])
    }

    pub fn resets(&self, address: u8) -> u32 {
        self.inner.lock().pmics.get(&address).map_or(0, |p| p.resets)
    }

    pub fn level(&self, pin: u32) -> bool {
        self.inner.lock().levels.get(&pin).is_some_and(|(high, _)| *high)
    }

    pub fn events(&self) -> Vec<PinEvent> {
        self.inner.lock().events.clone()
    }

    /// Pins driven high, in order, each listed once.
    pub fn asserted_order(&self) -> Vec<u32> {
        let mut order = Vec::new();
        for event in self.inner.lock().events.iter().filter(|e| e.high) {
            if !order.contains(&event.pin) {
                order.push(event.pin);
            }
        }
        order
    }

    /// When `pin` was first driven high.
    pub fn first_asserted(&self, pin: u32) -> Option<Instant> {
        self.inner
            .lock()
            .events
            .iter()
            .find(|e| e.pin == pin && e.high)
            .map(|e| e.at)
    }
}

/// I2C handle onto a [`SimBoard`].
pub struct SimI2c {
    board: SimBoard,
}

#[async_trait]
impl I2c for SimI2c {
    async fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
        _hold_bus: bool,
    ) -> Result<usize, TransportError> {
        let behaviour = {
            let mut inner = self.board.inner.lock();
            inner.transfers.push(Transfer {
                address,
                read: false,
                bytes: bytes.to_vec(),
                at: Instant::now(),
            });
            let Some(pmic) = inner.pmics.get_mut(&address) else {
                return Err(TransportError::AddressNack);
            };
            if pmic.behaviour != Behaviour::Hung {
                if let Some((&offset, data)) = bytes.split_first() {
                    pmic.pointer = offset;
                    pmic.write_registers(offset, data);
                }
            }
            pmic.behaviour
        };
        if behaviour == Behaviour::Hung {
            std::future::pending::<()>().await;
        }
        Ok(bytes.len())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let (silent, len) = {
            let mut inner = self.board.inner.lock();
            let Some(pmic) = inner.pmics.get_mut(&address) else {
                return Err(TransportError::AddressNack);
            };
            let behaviour = pmic.behaviour;
            let len = match behaviour {
                Behaviour::FailingReads => return Err(TransportError::Bus("no data".into())),
                Behaviour::ShortReads(n) => n.min(buffer.len()),
                _ => buffer.len(),
            };
            let silent = matches!(behaviour, Behaviour::Hung | Behaviour::HungReads);
            if !silent {
                pmic.read_registers(&mut buffer[..len]);
                let bytes = buffer[..len].to_vec();
                inner.transfers.push(Transfer {
                    address,
                    read: true,
                    bytes,
                    at: Instant::now(),
                });
            }
            (silent, len)
        };
        if silent {
            std::future::pending::<()>().await;
        }
        Ok(len)
    }

    async fn set_frequency(&mut self, hz: u32) -> Result<(), TransportError> {
        self.board.inner.lock().frequency = Some(hz);
        Ok(())
    }
}

/// Output pin on a [`SimBoard`].
pub struct SimOutput {
    board: SimBoard,
    pin: u32,
}

#[async_trait]
impl OutputPin for SimOutput {
    async fn set(&mut self, high: bool) -> Result<(), GpioError> {
        let now = Instant::now();
        let mut inner = self.board.inner.lock();
        let changed = inner.levels.get(&self.pin).map_or(true, |(level, _)| *level != high);
        if changed {
            inner.levels.insert(self.pin, (high, now));
        }
        inner.events.push(PinEvent {
            pin: self.pin,
            high,
            at: now,
        });
        Ok(())
    }
}

/// Power-good input on a [`SimBoard`].
pub struct SimInput {
    board: SimBoard,
    pin: u32,
}

#[async_trait]
impl InputPin for SimInput {
    async fn is_high(&mut self) -> Result<bool, GpioError> {
        Ok(self.board.inner.lock().power_good_level(self.pin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_status_clears_on_read_and_reset_restores_it() {
        let board = SimBoard::new();
        board.add_pmic(0x42, SimPmic::tps6287x());
        let mut i2c = board.i2c();
        let mut buf = [0u8; WINDOW_LEN];

        i2c.write(0x42, &[0x00], true).await.unwrap();
        i2c.read(0x42, &mut buf).await.unwrap();
        assert_eq!(buf[4], tps6287x::defaults::STATUS);
        assert_eq!(board.register(0x42, Register::Status), Some(0));

        i2c.write(0x42, &[0x01, 0xAA], false).await.unwrap();
        assert_eq!(board.resets(0x42), 1);
        assert_eq!(board.register(0x42, Register::Status), Some(tps6287x::defaults::STATUS));
        assert_eq!(board.register(0x42, Register::Control1), Some(tps6287x::defaults::CONTROL1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_register_survives_reset() {
        let board = SimBoard::new();
        board.add_pmic(0x42, SimPmic::tps6287x().stuck(Register::Control3, 0x11));
        let mut i2c = board.i2c();
        i2c.write(0x42, &[0x01, 0x80], false).await.unwrap();
        assert_eq!(board.register(0x42, Register::Control3), Some(0x11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_good_follows_enable() {
        let board = SimBoard::new();
        board.link_power_good(8, 2, Some(Duration::from_millis(5)));
        let mut enable = board.output(8);
        let mut pg = board.input(2);

        assert!(!pg.is_high().await.unwrap());
        enable.set(true).await.unwrap();
        assert!(!pg.is_high().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pg.is_high().await.unwrap());

        board.force_power_good(2, Some(false));
        assert!(!pg.is_high().await.unwrap());
    }
}
