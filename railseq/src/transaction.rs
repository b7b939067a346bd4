//! Register-offset transactions over the shared I2C bus.
//!
//! Every PMIC access goes through [`Bus`]: a write frames the register
//! offset in front of the payload, a read writes the offset and then reads
//! the window back. Payload sizes are clamped to `1..=MAX_WINDOW`, each bus
//! phase is bounded by the configured timeout, and failures are reported
//! with the phase they happened in. Nothing here retries.

use std::time::Duration;

use strum::Display;
use thiserror::Error;
use tokio::time;

use crate::hw_trait::{I2c, TransportError};
use crate::tracing::prelude::*;

/// Largest register window moved in one transaction.
pub const MAX_WINDOW: usize = 6;

/// Clamp a requested byte count into `1..=MAX_WINDOW`.
pub fn clamp_window(count: usize) -> usize {
    count.clamp(1, MAX_WINDOW)
}

/// Which half of a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// A register write, or the offset write that starts a read. A failure
    /// here means the device did not take its address.
    Write,
    /// The data phase of a read: the device took the offset but did not answer.
    Read,
}

/// Transaction Layer errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("{phase} phase timed out")]
    Timeout { phase: Phase },
    #[error("{phase} phase bus error")]
    Fault { phase: Phase },
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

impl BusError {
    pub fn phase(&self) -> Phase {
        match self {
            BusError::Timeout { phase } | BusError::Fault { phase } => *phase,
            BusError::ShortRead { .. } => Phase::Read,
        }
    }

    /// Stable numeric code for field diagnosis.
    pub fn code(&self) -> i8 {
        match self {
            BusError::Timeout { phase: Phase::Write } => -1,
            BusError::Fault { phase: Phase::Write } => -2,
            BusError::Timeout { phase: Phase::Read } => -3,
            BusError::Fault { phase: Phase::Read } => -4,
            BusError::ShortRead { .. } => -5,
        }
    }

    // A NACKed address belongs to the write phase even when a backend that
    // sends the offset and the read in one transfer reports it from `read`.
    fn from_transport(err: TransportError, phase: Phase) -> Self {
        match err {
            TransportError::Timeout => BusError::Timeout { phase },
            TransportError::AddressNack => BusError::Fault {
                phase: Phase::Write,
            },
            TransportError::Bus(_) => BusError::Fault { phase },
        }
    }
}

/// Bus parameters fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub frequency_hz: u32,
    pub timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100_000,
            timeout: Duration::from_millis(250),
        }
    }
}

/// Registers read back in one transaction, starting at the requested offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWindow {
    bytes: [u8; MAX_WINDOW],
    len: usize,
}

impl RegisterWindow {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Exclusive owner of the I2C bus.
pub struct Bus<I> {
    i2c: I,
    config: BusConfig,
}

impl<I: I2c> Bus<I> {
    /// Take ownership of `i2c` and apply the bus clock once.
    pub async fn open(mut i2c: I, config: BusConfig) -> Result<Self, TransportError> {
        i2c.set_frequency(config.frequency_hz).await?;
        debug!(
            "I2C bus at {} kHz, {} ms timeout",
            config.frequency_hz / 1000,
            config.timeout.as_millis()
        );
        Ok(Self { i2c, config })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Write `bytes` to consecutive registers of `device` starting at `offset`.
    ///
    /// The payload is clamped to `1..=MAX_WINDOW` bytes: a longer slice is
    /// truncated and an empty one is sent as a single zero byte. Returns the
    /// number of payload bytes the device accepted.
    pub async fn write(
        &mut self,
        device: u8,
        offset: u8,
        bytes: &[u8],
    ) -> Result<usize, BusError> {
        let len = clamp_window(bytes.len());
        let mut frame = [0u8; MAX_WINDOW + 1];
        frame[0] = offset;
        let payload = &bytes[..bytes.len().min(len)];
        frame[1..=payload.len()].copy_from_slice(payload);

        trace!("I2C write 0x{:02X}@0x{:02X}: {:02X?}", device, offset, &frame[1..=len]);
        let written = self.bounded(Phase::Write, device, &frame[..=len], true).await?;
        Ok(written.saturating_sub(1))
    }

    /// Read `count` consecutive registers of `device` starting at `offset`.
    ///
    /// `count` is clamped to `1..=MAX_WINDOW`. The offset is written without
    /// releasing the bus, then the window is read back; each phase has its
    /// own timeout and reports its own [`Phase`].
    pub async fn read(
        &mut self,
        device: u8,
        offset: u8,
        count: usize,
    ) -> Result<RegisterWindow, BusError> {
        let len = clamp_window(count);
        self.bounded(Phase::Write, device, &[offset], false).await?;

        let mut window = RegisterWindow {
            bytes: [0u8; MAX_WINDOW],
            len: 0,
        };
        let data = self.i2c.read(device, &mut window.bytes[..len]);
        let read = match time::timeout(self.config.timeout, data).await {
            Ok(Ok(n)) => n.min(len),
            Ok(Err(e)) => {
                trace!("I2C read 0x{:02X}@0x{:02X} failed: {}", device, offset, e);
                return Err(BusError::from_transport(e, Phase::Read));
            }
            Err(_) => return Err(BusError::Timeout { phase: Phase::Read }),
        };
        if read < len {
            return Err(BusError::ShortRead {
                expected: len,
                actual: read,
            });
        }
        window.len = read;
        trace!("I2C read 0x{:02X}@0x{:02X}: {:02X?}", device, offset, window.as_slice());
        Ok(window)
    }

    // One bounded write transfer. `stop` false keeps the bus for a following read.
    async fn bounded(
        &mut self,
        phase: Phase,
        device: u8,
        frame: &[u8],
        stop: bool,
    ) -> Result<usize, BusError> {
        match time::timeout(self.config.timeout, self.i2c.write(device, frame, !stop)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                trace!("I2C write 0x{:02X} failed: {}", device, e);
                Err(BusError::from_transport(e, phase))
            }
            Err(_) => Err(BusError::Timeout { phase }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoard, SimPmic};
    use test_case::test_case;

    #[test_case(0 => 1; "zero clamps up")]
    #[test_case(1 => 1; "lower bound")]
    #[test_case(5 => 5; "in range")]
    #[test_case(6 => 6; "upper bound")]
    #[test_case(7 => 6; "one over")]
    #[test_case(usize::MAX => 6; "huge")]
    fn test_clamp_window(count: usize) -> usize {
        clamp_window(count)
    }

    async fn bus_with(board: &SimBoard) -> Bus<crate::sim::SimI2c> {
        Bus::open(board.i2c(), BusConfig::default()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_applies_frequency() {
        let board = SimBoard::new();
        let _bus = bus_with(&board).await;
        assert_eq!(board.frequency(), Some(100_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_frames_offset_and_truncates_payload() {
        let board = SimBoard::new();
        board.add_pmic(0x42, SimPmic::tps6287x());
        let mut bus = bus_with(&board).await;

        let accepted = bus.write(0x42, 0x00, &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        assert_eq!(accepted, MAX_WINDOW);

        let frames = board.transfers();
        let last = frames.last().unwrap();
        assert_eq!(last.address, 0x42);
        assert_eq!(last.bytes, vec![0x00, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_write_sends_one_byte() {
        let board = SimBoard::new();
        board.add_pmic(0x42, SimPmic::tps6287x());
        let mut bus = bus_with(&board).await;

        assert_eq!(bus.write(0x42, 0x03, &[]).await.unwrap(), 1);
        assert_eq!(board.transfers().last().unwrap().bytes, vec![0x03, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_clamps_count() {
        let board = SimBoard::new();
        board.add_pmic(0x42, SimPmic::tps6287x());
        let mut bus = bus_with(&board).await;

        assert_eq!(bus.read(0x42, 0x00, 0).await.unwrap().len(), 1);
        assert_eq!(bus.read(0x42, 0x00, 200).await.unwrap().len(), MAX_WINDOW);
        assert!(board
            .transfers()
            .iter()
            .all(|t| !t.bytes.is_empty() && t.bytes.len() <= MAX_WINDOW + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_returns_window() {
        let board = SimBoard::new();
        board.add_pmic(0x41, SimPmic::tps6287x());
        let mut bus = bus_with(&board).await;

        let window = bus.read(0x41, 0x01, 3).await.unwrap();
        assert_eq!(window.as_slice(), &[0x2A, 0x09, 0x00]);
        assert_eq!(window.get(3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_device_fails_in_write_phase() {
        let board = SimBoard::new();
        let mut bus = bus_with(&board).await;

        let err = bus.read(0x40, 0x00, 5).await.unwrap_err();
        assert_eq!(err, BusError::Fault { phase: Phase::Write });
        assert_eq!(err.code(), -2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_phase_failure_is_distinct() {
        let board = SimBoard::new();
        board.add_pmic(0x40, SimPmic::tps6287x().failing_reads());
        let mut bus = bus_with(&board).await;

        let err = bus.read(0x40, 0x00, 5).await.unwrap_err();
        assert_eq!(err, BusError::Fault { phase: Phase::Read });
        assert_eq!(err.code(), -4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_device_times_out_within_bound() {
        let board = SimBoard::new();
        board.add_pmic(0x40, SimPmic::tps6287x().hung());
        let mut bus = bus_with(&board).await;

        let start = time::Instant::now();
        let err = bus.read(0x40, 0x00, 5).await.unwrap_err();
        assert_eq!(err, BusError::Timeout { phase: Phase::Write });
        assert_eq!(start.elapsed(), Duration::from_millis(250));

        let err = bus.write(0x40, 0x01, &[0xAA]).await.unwrap_err();
        assert_eq!(err.code(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_data_phase_times_out_as_read() {
        let board = SimBoard::new();
        board.add_pmic(0x41, SimPmic::tps6287x().hung_reads());
        let mut bus = bus_with(&board).await;

        let start = time::Instant::now();
        let err = bus.read(0x41, 0x00, 5).await.unwrap_err();
        assert_eq!(err, BusError::Timeout { phase: Phase::Read });
        assert_eq!(err.code(), -3);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        // the offset went out, nothing came back
        assert!(board.transfers().iter().all(|t| !t.read));
    }

    #[test]
    fn test_address_nack_is_a_write_phase_fault() {
        let err = BusError::from_transport(TransportError::AddressNack, Phase::Read);
        assert_eq!(err, BusError::Fault { phase: Phase::Write });
        assert_eq!(err.code(), -2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_is_reported() {
        let board = SimBoard::new();
        board.add_pmic(0x40, SimPmic::tps6287x().short_reads(2));
        let mut bus = bus_with(&board).await;

        let err = bus.read(0x40, 0x00, 5).await.unwrap_err();
        assert_eq!(err, BusError::ShortRead { expected: 5, actual: 2 });
        assert_eq!(err.phase(), Phase::Read);
    }
}
