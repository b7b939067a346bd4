//! PMIC register verification.
//!
//! A PMIC passes verification when its CONTROL1, CONTROL2, CONTROL3 and
//! STATUS registers hold their power-on defaults. VSET is read with the rest
//! of the window but not checked, since bring-up overwrites it.

use crate::config::{PmicDescriptor, RegisterDefaults};
use crate::error::Fault;
use crate::hw_trait::I2c;
use crate::peripheral::tps6287x::{Register, WINDOW_LEN};
use crate::tracing::prelude::*;
use crate::transaction::{Bus, BusError, Phase};

/// Result of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass,
    /// The window could not be read.
    NoResponse(BusError),
    /// First register, in check order, that differs from its default.
    Mismatch { register: Register, expected: u8, actual: u8 },
}

impl VerifyOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, VerifyOutcome::Pass)
    }

    /// Classify a failed outcome for the PMIC in device-map position `slot`.
    pub fn fault(&self, pmic: &PmicDescriptor, slot: usize) -> Option<Fault> {
        let name = pmic.name.clone();
        match *self {
            VerifyOutcome::Pass => None,
            VerifyOutcome::NoResponse(error) if error.phase() == Phase::Write => {
                Some(Fault::DeviceAbsent {
                    pmic: name,
                    slot,
                    error,
                })
            }
            VerifyOutcome::NoResponse(error) => Some(Fault::BusError {
                pmic: name,
                slot,
                error,
            }),
            VerifyOutcome::Mismatch {
                register,
                expected,
                actual,
            } => Some(Fault::RegisterMismatch {
                pmic: name,
                slot,
                register,
                expected,
                actual,
            }),
        }
    }
}

/// Registers checked, in check order, with their expected values.
pub fn expected_defaults(defaults: &RegisterDefaults) -> [(Register, u8); 4] {
    [
        (Register::Control1, defaults.control1),
        (Register::Control2, defaults.control2),
        (Register::Control3, defaults.control3),
        (Register::Status, defaults.status),
    ]
}

/// Read the register window of `pmic` and compare it with its defaults.
///
/// Issues exactly one read and never writes to the device.
pub async fn verify<I: I2c>(bus: &mut Bus<I>, pmic: &PmicDescriptor) -> VerifyOutcome {
    let window = match bus.read(pmic.address, Register::Vset.offset(), WINDOW_LEN).await {
        Ok(window) => window,
        Err(e) => {
            debug!(
                "{} PMIC (0x{:02X}) read failed: {} (code {})",
                pmic.name,
                pmic.address,
                e,
                e.code()
            );
            return VerifyOutcome::NoResponse(e);
        }
    };
    debug!("{} PMIC registers: {}", pmic.name, hex::encode(window.as_slice()));

    for (register, expected) in expected_defaults(&pmic.defaults) {
        let actual = window.get(register.offset() as usize).unwrap_or_default();
        if actual != expected {
            return VerifyOutcome::Mismatch {
                register,
                expected,
                actual,
            };
        }
    }
    VerifyOutcome::Pass
}
