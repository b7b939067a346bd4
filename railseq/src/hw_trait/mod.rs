//! Hardware abstraction layer traits.
//!
//! This module defines the hardware interface traits (I2C and GPIO) that
//! the controller is written against, so the same bring-up logic runs on
//! Linux i2c-dev/sysfs hardware or on the simulated board used for tests.

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by an I2C backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backend gave up waiting on the bus.
    #[error("transfer timed out")]
    Timeout,
    /// Nobody acknowledged the address.
    #[error("address not acknowledged")]
    AddressNack,
    /// Anything else: data NACK, arbitration loss, driver error.
    #[error("bus error: {0}")]
    Bus(String),
}

/// Failure reported by a GPIO backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("GPIO {pin}: {message}")]
pub struct GpioError {
    pub pin: u32,
    pub message: String,
}

/// Raw I2C transport, addressed with 7-bit device addresses.
///
/// Implementations perform exactly one bus transfer per call and never
/// retry. Both calls return the number of bytes actually transferred.
#[async_trait]
pub trait I2c: Send {
    /// Write `bytes` to `address`.
    ///
    /// With `hold_bus` set the transfer ends in a repeated start rather than
    /// a stop, so a following [`I2c::read`] continues the same transaction.
    /// A backend may hold such a write back and put it on the wire together
    /// with that read, in which case an address NACK surfaces from `read`.
    async fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
        hold_bus: bool,
    ) -> Result<usize, TransportError>;

    /// Read into `buffer` from `address`, ending with a stop.
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Apply the bus clock. Backends with a fixed clock may ignore this.
    async fn set_frequency(&mut self, _hz: u32) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Controller-driven output line (rail enable, global power-good, fault indicator).
#[async_trait]
pub trait OutputPin: Send {
    async fn set(&mut self, high: bool) -> Result<(), GpioError>;
}

/// Externally driven input line (rail power-good).
#[async_trait]
pub trait InputPin: Send {
    async fn is_high(&mut self) -> Result<bool, GpioError>;
}
