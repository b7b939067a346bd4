//! Linux hardware backends: i2c-dev for the bus, sysfs for GPIO.

pub mod i2cdev;
pub mod sysfs_gpio;

use crate::config::BoardConfig;
use crate::controller::Hardware;
use crate::error::Result;
use crate::hw_trait::{InputPin, OutputPin};
use crate::tracing::prelude::*;

pub use i2cdev::I2cDev;
pub use sysfs_gpio::{SysfsInput, SysfsOutput};

/// Open the bus and every pin `config` names. Outputs come up low.
pub async fn open(config: &BoardConfig) -> Result<Hardware<I2cDev>> {
    let bus = config.bus.bus_config();
    let i2c = I2cDev::open(&config.bus.device, bus.timeout)?;

    let gpio = &config.gpio;
    let root = gpio.sysfs_root.as_path();
    let mut enables: Vec<Box<dyn OutputPin>> = Vec::with_capacity(config.rails.len());
    let mut power_good: Vec<Option<Box<dyn InputPin>>> = Vec::with_capacity(config.rails.len());
    for rail in &config.rails {
        enables.push(Box::new(SysfsOutput::open(root, gpio.base, rail.enable).await?));
        let input = match rail.power_good {
            Some(pin) => Some(SysfsInput::open(root, gpio.base, pin).await?),
            None => None,
        };
        power_good.push(input.map(|pin| Box::new(pin) as Box<dyn InputPin>));
    }

    let global_power_good =
        Box::new(SysfsOutput::open(root, gpio.base, gpio.power_good_output).await?);
    let fault_indicator = match gpio.fault_indicator {
        Some(pin) => Some(SysfsOutput::open(root, gpio.base, pin).await?),
        None => None,
    };
    let fault_indicator = fault_indicator.map(|pin| Box::new(pin) as Box<dyn OutputPin>);

    info!(
        "Hardware open: {}, {} rails on {}",
        config.bus.device.display(),
        config.rails.len(),
        root.display()
    );
    Ok(Hardware {
        i2c,
        enables,
        power_good,
        global_power_good,
        fault_indicator,
    })
}
