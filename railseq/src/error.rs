//! Common error types for railseq.
//!
//! [`Fault`] is everything that stops a bring-up and puts the controller in
//! its terminal fault state; each variant carries a stable numeric code for
//! field diagnosis. [`Error`] is the crate-level error used by configuration
//! loading and hardware setup.

use thiserror::Error;

use crate::hw_trait::{GpioError, TransportError};
use crate::peripheral::tps6287x::Register;
use crate::transaction::BusError;

/// A condition that ends bring-up for this boot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The device did not take its address during verification.
    #[error("{pmic} PMIC did not respond ({error})")]
    DeviceAbsent { pmic: String, slot: usize, error: BusError },

    /// The device took its address but the read-back failed.
    #[error("{pmic} PMIC read-back failed ({error})")]
    BusError { pmic: String, slot: usize, error: BusError },

    #[error(
        "non-default read-back from {pmic} PMIC {register}: \
         expected 0x{expected:02X}, received 0x{actual:02X}"
    )]
    RegisterMismatch {
        pmic: String,
        slot: usize,
        register: Register,
        expected: u8,
        actual: u8,
    },

    #[error("programming {pmic} PMIC {register} failed ({error})")]
    ProgramFailed {
        pmic: String,
        slot: usize,
        register: Register,
        error: BusError,
    },

    #[error("{rail} rail did not report power-good within {timeout_ms} ms")]
    PowerGoodTimeout { rail: String, index: usize, timeout_ms: u64 },

    #[error("{rail} rail lost power-good")]
    PowerGoodLost { rail: String, index: usize },

    #[error("{0}")]
    Gpio(#[from] GpioError),
}

impl Fault {
    /// Stable numeric code.
    ///
    /// PMIC faults are `10 * slot + k` where `slot` is the PMIC's position in
    /// the device map: k = 1 absent, 2..=5 CONTROL1..STATUS mismatch, 6 read
    /// error. Rail faults are `100 + index` (power-good timeout) and
    /// `150 + index` (power-good lost); programming failures are
    /// `200 + 10 * slot + register offset`; GPIO failures are 250. Codes are
    /// unique as long as the board stays within
    /// [`MAX_PMICS`](crate::config::MAX_PMICS) and
    /// [`MAX_RAILS`](crate::config::MAX_RAILS).
    pub fn code(&self) -> u16 {
        match self {
            Fault::DeviceAbsent { slot, .. } => 10 * *slot as u16 + 1,
            Fault::RegisterMismatch { slot, register, .. } => {
                10 * *slot as u16 + 1 + register.offset() as u16
            }
            Fault::BusError { slot, .. } => 10 * *slot as u16 + 6,
            Fault::PowerGoodTimeout { index, .. } => 100 + *index as u16,
            Fault::PowerGoodLost { index, .. } => 150 + *index as u16,
            Fault::ProgramFailed { slot, register, .. } => {
                200 + 10 * *slot as u16 + register.offset() as u16
            }
            Fault::Gpio(_) => 250,
        }
    }
}

/// Main error type for railseq operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file syntax errors
    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I2C error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Gpio(#[from] GpioError),

    #[error("{} (code {})", .0, .0.code())]
    Fault(#[from] Fault),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
