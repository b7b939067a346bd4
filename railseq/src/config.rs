//! Board configuration.
//!
//! This module describes the board the controller brings up: the bus
//! parameters, timing, GPIO wiring, the PMIC device map in verification
//! order and the rails in enable order. Configuration is loaded from a
//! TOML file; [`BoardConfig::default`] is the reference mainboard.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peripheral::tps6287x;
use crate::transaction::BusConfig;

/// Most PMICs a board may list. Fault codes give each PMIC a band of ten
/// below 100 and of ten between 200 and 250.
pub const MAX_PMICS: usize = 5;

/// Most rails a board may list. Rail fault codes are `100 + index` and
/// `150 + index`.
pub const MAX_RAILS: usize = 50;

/// Everything the controller needs to know about the board.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BoardConfig {
    #[serde(default)]
    pub bus: BusSection,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub gpio: GpioConfig,

    /// PMICs in verification order.
    #[serde(rename = "pmic")]
    pub pmics: Vec<PmicDescriptor>,

    /// Rails; enabled stage by stage in ascending stage order.
    #[serde(rename = "rail")]
    pub rails: Vec<RailConfig>,
}

/// I2C bus configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusSection {
    /// Linux i2c-dev node
    pub device: PathBuf,

    pub frequency_hz: u32,

    /// Bound on every bus phase
    pub timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/i2c-1"),
            frequency_hz: 100_000,
            timeout_ms: 250,
        }
    }
}

impl BusSection {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            frequency_hz: self.frequency_hz,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Delays and bounds used during bring-up and supervision.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Settle time before the first bus transaction
    #[serde(rename = "startup_delay_ms", with = "millis")]
    pub startup_delay: Duration,

    /// Pause between bus scan probes
    #[serde(rename = "probe_settle_ms", with = "millis")]
    pub probe_settle: Duration,

    /// Pause after each device verification
    #[serde(rename = "verify_delay_ms", with = "millis")]
    pub verify_delay: Duration,

    /// Pause after programming each device
    #[serde(rename = "program_settle_ms", with = "millis")]
    pub program_settle: Duration,

    /// Pause between programming and the first enable
    #[serde(rename = "pre_sequence_delay_ms", with = "millis")]
    pub pre_sequence_delay: Duration,

    /// Pause after a stage's enables before power-good is checked
    #[serde(rename = "rail_settle_ms", with = "millis")]
    pub rail_settle: Duration,

    #[serde(rename = "power_good_timeout_ms", with = "millis")]
    pub power_good_timeout: Duration,

    #[serde(rename = "power_good_poll_ms", with = "millis")]
    pub power_good_poll: Duration,

    /// Consecutive matching samples needed to accept a power-good level
    pub power_good_samples: u32,

    #[serde(rename = "supervise_interval_ms", with = "millis")]
    pub supervise_interval: Duration,

    #[serde(rename = "heartbeat_ms", with = "millis")]
    pub heartbeat: Duration,

    /// Interval of the fault reminder while faulted
    #[serde(rename = "fault_report_ms", with = "millis")]
    pub fault_report: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_millis(5000),
            probe_settle: Duration::from_millis(5),
            verify_delay: Duration::from_millis(200),
            program_settle: Duration::from_millis(2),
            pre_sequence_delay: Duration::from_millis(2000),
            rail_settle: Duration::from_millis(100),
            power_good_timeout: Duration::from_millis(500),
            power_good_poll: Duration::from_millis(1),
            power_good_samples: 3,
            supervise_interval: Duration::from_millis(50),
            heartbeat: Duration::from_millis(5000),
            fault_report: Duration::from_millis(10_000),
        }
    }
}

/// GPIO wiring outside the per-rail pins.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GpioConfig {
    pub sysfs_root: PathBuf,

    /// Added to every pin number to form the sysfs GPIO number
    pub base: u32,

    /// Global power-good output
    pub power_good_output: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_indicator: Option<u32>,

    /// Switch enabled rails off, last enabled first, when a fault is entered
    pub shutdown_on_fault: bool,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            base: 0,
            power_good_output: 0,
            fault_indicator: None,
            shutdown_on_fault: true,
        }
    }
}

/// Static description of one PMIC.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PmicDescriptor {
    pub name: String,

    /// 7-bit bus address
    pub address: u8,

    #[serde(default)]
    pub defaults: RegisterDefaults,

    pub targets: ProgramTargets,
}

/// Register values expected right after power-on or reset.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegisterDefaults {
    pub control1: u8,
    pub control2: u8,
    pub control3: u8,
    pub status: u8,
}

impl Default for RegisterDefaults {
    fn default() -> Self {
        Self {
            control1: tps6287x::defaults::CONTROL1,
            control2: tps6287x::defaults::CONTROL2,
            control3: tps6287x::defaults::CONTROL3,
            status: tps6287x::defaults::STATUS,
        }
    }
}

/// Operating values programmed during bring-up.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProgramTargets {
    /// Output voltage code
    pub vset: u8,

    /// Voltage range and operating mode
    pub control2: u8,

    #[serde(default = "default_control1")]
    pub control1: u8,

    #[serde(default = "default_control3")]
    pub control3: u8,
}

fn default_control1() -> u8 {
    tps6287x::targets::CONTROL1
}

fn default_control3() -> u8 {
    tps6287x::targets::CONTROL3
}

/// One rail's GPIO wiring and place in the enable order.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RailConfig {
    pub name: String,

    /// Enable output pin
    pub enable: u32,

    /// Power-good input pin, if the rail has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_good: Option<u32>,

    /// 1-based enable stage
    pub stage: u8,
}

impl BoardConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the controller relies on.
    pub fn validate(&self) -> Result<()> {
        if self.pmics.is_empty() {
            return Err(Error::Config("no PMICs configured".into()));
        }
        if self.rails.is_empty() {
            return Err(Error::Config("no rails configured".into()));
        }
        if self.pmics.len() > MAX_PMICS {
            return Err(Error::Config(format!(
                "{} PMICs configured, at most {} supported",
                self.pmics.len(),
                MAX_PMICS
            )));
        }
        if self.rails.len() > MAX_RAILS {
            return Err(Error::Config(format!(
                "{} rails configured, at most {} supported",
                self.rails.len(),
                MAX_RAILS
            )));
        }
        if self.bus.timeout_ms == 0 {
            return Err(Error::Config("bus timeout must be non-zero".into()));
        }
        if self.timing.power_good_samples == 0 {
            return Err(Error::Config("power_good_samples must be at least 1".into()));
        }

        let mut addresses = HashSet::new();
        let mut names = HashSet::new();
        for pmic in &self.pmics {
            if pmic.address > 0x7F {
                return Err(Error::Config(format!(
                    "PMIC {} address 0x{:02X} is not a 7-bit address",
                    pmic.name, pmic.address
                )));
            }
            if !addresses.insert(pmic.address) {
                return Err(Error::Config(format!("duplicate PMIC address 0x{:02X}", pmic.address)));
            }
            if !names.insert(pmic.name.as_str()) {
                return Err(Error::Config(format!("duplicate PMIC name {}", pmic.name)));
            }
        }

        let mut names = HashSet::new();
        for rail in &self.rails {
            if rail.stage == 0 {
                return Err(Error::Config(format!(
                    "rail {} has stage 0; stages start at 1",
                    rail.name
                )));
            }
            if !names.insert(rail.name.as_str()) {
                return Err(Error::Config(format!("duplicate rail name {}", rail.name)));
            }
        }
        Ok(())
    }
}

impl Default for BoardConfig {
    /// The reference mainboard: three TPS6287x PMICs and five rails in three stages.
    fn default() -> Self {
        let pmic = |name: &str, address: u8, vset: u8, control2: u8| PmicDescriptor {
            name: name.into(),
            address,
            defaults: RegisterDefaults::default(),
            targets: ProgramTargets {
                vset,
                control2,
                control1: default_control1(),
                control3: default_control3(),
            },
        };
        let rail = |name: &str, enable: u32, power_good: Option<u32>, stage: u8| RailConfig {
            name: name.into(),
            enable,
            power_good,
            stage,
        };

        Self {
            bus: BusSection::default(),
            timing: TimingConfig::default(),
            gpio: GpioConfig::default(),
            pmics: vec![
                pmic("3V3", 0x42, 0xFA, 0b0000_1101),
                pmic("1V8", 0x41, 0x64, 0b0000_1101),
                pmic("1V0", 0x40, 0xF0, 0b0000_0101),
            ],
            rails: vec![
                rail("1V0", 8, Some(2), 1),
                rail("1V8", 10, Some(3), 2),
                rail("1V2_GTX", 14, Some(7), 2),
                rail("1V8_GTX", 15, None, 2),
                rail("3V3", 12, Some(5), 3),
            ],
        }
    }
}

/// Serde adapter for durations written as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[pmic]]
        name = "CORE"
        address = 0x40
        targets = { vset = 0xF0, control2 = 0x05 }

        [[rail]]
        name = "CORE"
        enable = 8
        power_good = 2
        stage = 1
    "#;

    #[test]
    fn test_reference_board_is_valid() {
        let config = BoardConfig::default();
        config.validate().unwrap();
        let stages: Vec<u8> = config.rails.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![1, 2, 2, 2, 3]);
        let order: Vec<&str> = config.pmics.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(order, vec!["3V3", "1V8", "1V0"]);
    }

    #[test]
    fn test_minimal_toml_fills_defaults() {
        let config = BoardConfig::from_toml(MINIMAL).unwrap();
        let pmic = &config.pmics[0];
        assert_eq!(pmic.defaults, RegisterDefaults::default());
        assert_eq!(pmic.targets.control1, 0x68);
        assert_eq!(pmic.targets.control3, 0x02);
        assert_eq!(config.bus.bus_config().timeout, Duration::from_millis(250));
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.rails[0].power_good, Some(2));
    }

    #[test]
    fn test_timing_override_in_millis() {
        let text = format!("{MINIMAL}\n[timing]\npower_good_timeout_ms = 40\n");
        let config = BoardConfig::from_toml(&text).unwrap();
        assert_eq!(config.timing.power_good_timeout, Duration::from_millis(40));
        assert_eq!(config.timing.rail_settle, Duration::from_millis(100));
    }

    #[test]
    fn test_reference_board_round_trips_through_toml() {
        let text = toml::to_string(&BoardConfig::default()).unwrap();
        assert_eq!(BoardConfig::from_toml(&text).unwrap(), BoardConfig::default());
    }

    #[test]
    fn test_rejects_wide_address() {
        let text = MINIMAL.replace("0x40", "0x90");
        let err = BoardConfig::from_toml(&text).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("7-bit")));
    }

    #[test]
    fn test_rejects_duplicate_address() {
        let mut config = BoardConfig::default();
        config.pmics[1].address = config.pmics[0].address;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_stage_zero() {
        let mut config = BoardConfig::default();
        config.rails[0].stage = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_samples() {
        let mut config = BoardConfig::default();
        config.timing.power_good_samples = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_more_pmics_than_codes_allow() {
        let mut config = BoardConfig::default();
        for address in 0x30..0x33 {
            let mut pmic = config.pmics[0].clone();
            pmic.name = format!("EXTRA{:02X}", address);
            pmic.address = address;
            config.pmics.push(pmic);
        }
        assert_eq!(config.pmics.len(), MAX_PMICS + 1);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("at most 5")));

        config.pmics.pop();
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_more_rails_than_codes_allow() {
        let mut config = BoardConfig::default();
        while config.rails.len() <= MAX_RAILS {
            let mut rail = config.rails[4].clone();
            rail.name = format!("EXTRA{}", config.rails.len());
            config.rails.push(rail);
        }
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("at most 50")));

        config.rails.pop();
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_missing_rails() {
        let text = MINIMAL.split("[[rail]]").next().unwrap();
        assert!(BoardConfig::from_toml(text).is_err());
    }
}
