//! Power-rail sequencing controller for boards built around TPS6287x PMICs.
//!
//! The controller verifies each PMIC over I2C, resets and re-verifies once
//! if anything is off, programs the operating registers, and then enables
//! the board's rails in dependency order, gating every stage on its
//! power-good signals.

pub mod config;
pub mod controller;
pub mod error;
#[cfg(target_os = "linux")]
pub mod hw;
pub mod hw_trait;
pub mod peripheral;
pub mod scan;
pub mod sequencer;
pub mod sim;
pub mod tracing;
pub mod transaction;
pub mod verify;
