//! Bus diagnostics.
//!
//! Probes every 7-bit address with a one-byte read of register 0 and
//! classifies the answer. Only the bus is touched, so a scan can run at any
//! point without affecting rail state.

use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::time;

use crate::hw_trait::I2c;
use crate::tracing::prelude::*;
use crate::transaction::{Bus, BusError, Phase};

/// Highest 7-bit address.
pub const LAST_ADDRESS: u8 = 0x7F;

/// Classification of one probed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Probe {
    Found,
    /// The address was not acknowledged.
    WriteError,
    /// The address was acknowledged but the data phase failed.
    ReadError,
    /// The device held the bus until the transfer timed out.
    NoResponse,
}

impl From<BusError> for Probe {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Fault { phase: Phase::Write } => Probe::WriteError,
            BusError::Fault { phase: Phase::Read } | BusError::ShortRead { .. } => Probe::ReadError,
            BusError::Timeout { .. } => Probe::NoResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub address: u8,
    pub probe: Probe,
}

/// Outcome of a full bus scan, one entry per address in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub results: Vec<ProbeResult>,
}

impl ScanReport {
    /// Addresses classified as [`Probe::Found`].
    pub fn found(&self) -> Vec<u8> {
        self.results
            .iter()
            .filter(|r| r.probe == Probe::Found)
            .map(|r| r.address)
            .collect()
    }

    pub fn any_found(&self) -> bool {
        self.results.iter().any(|r| r.probe == Probe::Found)
    }

    /// Number of addresses with the given classification.
    pub fn count(&self, probe: Probe) -> usize {
        self.results.iter().filter(|r| r.probe == probe).count()
    }
}

/// Probe addresses 0x00..=0x7F, pausing `settle` between probes.
pub async fn scan<I: I2c>(bus: &mut Bus<I>, settle: Duration) -> ScanReport {
    info!("Scanning I2C bus");
    let mut results = Vec::with_capacity(LAST_ADDRESS as usize + 1);

    for address in 0..=LAST_ADDRESS {
        let probe = match bus.read(address, 0x00, 1).await {
            Ok(_) => Probe::Found,
            Err(e) => Probe::from(e),
        };
        match probe {
            Probe::Found => info!("Device found at 0x{:02X}", address),
            Probe::WriteError => trace!("0x{:02X}: {}", address, probe),
            _ => debug!("0x{:02X}: {}", address, probe),
        }
        results.push(ProbeResult { address, probe });
        time::sleep(settle).await;
    }

    let report = ScanReport { results };
    if report.any_found() {
        info!("Scan complete, {} device(s) found", report.count(Probe::Found));
    } else {
        warn!("No devices found on bus");
    }
    report
}
