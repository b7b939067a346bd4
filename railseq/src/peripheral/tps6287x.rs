//! TPS6287x-Q1 step-down converter register map.
//!
//! The TPS62870/1/2/3-Q1 family shares one five-register map. This module
//! holds the offsets, the documented power-on defaults and the bit layout of
//! the registers the bring-up touches, plus decoders used for diagnostics.
//!
//! Datasheet: <https://www.ti.com/lit/ds/symlink/tps62873-q1.pdf>

use bitflags::bitflags;
use strum::{Display, EnumIter};

/// Registers in address order; the discriminant is the register offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Register {
    Vset = 0x00,
    Control1 = 0x01,
    Control2 = 0x02,
    Control3 = 0x03,
    Status = 0x04,
}

impl Register {
    pub const fn offset(self) -> u8 {
        self as u8
    }
}

/// Number of registers in the map, read as one window starting at VSET.
pub const WINDOW_LEN: usize = 5;

/// Power-on defaults shared by the family.
pub mod defaults {
    pub const CONTROL1: u8 = 0b0010_1010;
    pub const CONTROL2: u8 = 0b0000_1001;
    pub const CONTROL3: u8 = 0b0000_0000;
    /// STATUS is cleared on read, so this only holds for the first read after
    /// power-on or reset.
    pub const STATUS: u8 = 0b0000_0010;
}

/// Operating values this board programs into every device of the family.
pub mod targets {
    /// Software enable and spread spectrum on, output discharge kept.
    pub const CONTROL1: u8 = 0b0110_1000;
    pub const CONTROL3: u8 = 0b0000_0010;
}

bitflags! {
    /// CONTROL1 bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control1: u8 {
        /// Self-clearing; resets every register to its default.
        const RESET = 0x80;
        const SSCEN = 0x40;
        const SWEN = 0x20;
        const FPWMEN = 0x10;
        const DISCHEN = 0x08;
        const HICCUPEN = 0x04;
        const VRAMP = 0x03;
    }
}

/// CONTROL1 value that resets a device whose CONTROL1 currently reads `current`.
pub fn reset_command(current: u8) -> u8 {
    (Control1::from_bits_retain(current) | Control1::RESET).bits()
}

/// Human-readable names of the CONTROL1 bits set in `value`.
pub fn describe_control1(value: u8) -> Vec<&'static str> {
    let flags = Control1::from_bits_retain(value);
    let mut desc = Vec::new();
    if flags.contains(Control1::RESET) {
        desc.push("RESET");
    }
    if flags.contains(Control1::SSCEN) {
        desc.push("spread spectrum");
    }
    if flags.contains(Control1::SWEN) {
        desc.push("software enable");
    }
    if flags.contains(Control1::FPWMEN) {
        desc.push("forced PWM");
    }
    if flags.contains(Control1::DISCHEN) {
        desc.push("output discharge");
    }
    if flags.contains(Control1::HICCUPEN) {
        desc.push("hiccup");
    }
    desc
}

/// Output voltage range selected by CONTROL2 bits 3:2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VRange {
    #[strum(serialize = "0.4V + n*1.25mV")]
    Fine,
    #[strum(serialize = "0.4V + n*2.5mV")]
    Low,
    #[strum(serialize = "0.4V + n*5mV")]
    Mid,
    #[strum(serialize = "0.8V + n*10mV")]
    High,
}

impl VRange {
    pub fn from_control2(control2: u8) -> Self {
        match (control2 >> 2) & 0b11 {
            0b00 => VRange::Fine,
            0b01 => VRange::Low,
            0b10 => VRange::Mid,
            _ => VRange::High,
        }
    }

    // (offset, step) in microvolts
    fn offset_and_step_uv(self) -> (u32, u32) {
        match self {
            VRange::Fine => (400_000, 1_250),
            VRange::Low => (400_000, 2_500),
            VRange::Mid => (400_000, 5_000),
            VRange::High => (800_000, 10_000),
        }
    }
}

/// Output voltage in millivolts that `vset` selects under `control2`.
pub fn vset_to_millivolts(vset: u8, control2: u8) -> u32 {
    let (offset, step) = VRange::from_control2(control2).offset_and_step_uv();
    (offset + step * vset as u32) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    #[test]
    fn test_register_offsets_are_contiguous() {
        let offsets: Vec<u8> = Register::iter().map(Register::offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(offsets.len(), WINDOW_LEN);
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Register::Control2.to_string(), "CONTROL2");
        assert_eq!(Register::Vset.to_string(), "VSET");
    }

    #[test]
    fn test_reset_command_sets_only_reset_bit() {
        assert_eq!(reset_command(defaults::CONTROL1), 0b1010_1010);
        assert_eq!(reset_command(0x80), 0x80);
    }

    #[test]
    fn test_describe_control1() {
        let desc = describe_control1(targets::CONTROL1);
        assert_eq!(desc, vec!["spread spectrum", "software enable", "output discharge"]);
        assert!(describe_control1(0x00).is_empty());
    }

    // Reference board rails
    #[test_case(0xFA, 0b0000_1101 => 3300; "3v3 rail")]
    #[test_case(0x64, 0b0000_1101 => 1800; "1v8 rail")]
    #[test_case(0xF0, 0b0000_0101 => 1000; "1v0 rail")]
    #[test_case(0x00, 0b0000_0000 => 400; "fine range floor")]
    #[test_case(0xFF, 0b0000_1000 => 1675; "mid range ceiling")]
    fn test_vset_to_millivolts(vset: u8, control2: u8) -> u32 {
        vset_to_millivolts(vset, control2)
    }
}
