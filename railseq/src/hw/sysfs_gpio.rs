//! GPIO through the sysfs interface (`/sys/class/gpio`).

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::hw_trait::{GpioError, InputPin, OutputPin};
use crate::tracing::prelude::*;

// Export `gpio` if needed and return its directory.
async fn export(root: &Path, gpio: u32) -> io::Result<PathBuf> {
    let dir = root.join(format!("gpio{}", gpio));
    if fs::metadata(&dir).await.is_err() {
        fs::write(root.join("export"), gpio.to_string()).await?;
        trace!("Exported GPIO {}", gpio);
    }
    Ok(dir)
}

fn gpio_error(pin: u32, err: io::Error) -> GpioError {
    GpioError {
        pin,
        message: err.to_string(),
    }
}

/// Output line, configured low when opened.
pub struct SysfsOutput {
    pin: u32,
    value: PathBuf,
}

impl SysfsOutput {
    /// Export `base + pin` under `root` and make it an output driven low.
    pub async fn open(root: &Path, base: u32, pin: u32) -> Result<Self, GpioError> {
        let dir = export(root, base + pin).await.map_err(|e| gpio_error(pin, e))?;
        // "low" sets direction and level in one write, so the line never glitches high
        fs::write(dir.join("direction"), "low")
            .await
            .map_err(|e| gpio_error(pin, e))?;
        Ok(Self {
            pin,
            value: dir.join("value"),
        })
    }
}

#[async_trait]
impl OutputPin for SysfsOutput {
    async fn set(&mut self, high: bool) -> Result<(), GpioError> {
        fs::write(&self.value, if high { "1" } else { "0" })
            .await
            .map_err(|e| gpio_error(self.pin, e))
    }
}

/// Input line.
pub struct SysfsInput {
    pin: u32,
    value: PathBuf,
}

impl SysfsInput {
    pub async fn open(root: &Path, base: u32, pin: u32) -> Result<Self, GpioError> {
        let dir = export(root, base + pin).await.map_err(|e| gpio_error(pin, e))?;
        fs::write(dir.join("direction"), "in")
            .await
            .map_err(|e| gpio_error(pin, e))?;
        Ok(Self {
            pin,
            value: dir.join("value"),
        })
    }
}

#[async_trait]
impl InputPin for SysfsInput {
    async fn is_high(&mut self) -> Result<bool, GpioError> {
        let level = fs::read_to_string(&self.value)
            .await
            .map_err(|e| gpio_error(self.pin, e))?;
        match level.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(GpioError {
                pin: self.pin,
                message: format!("unexpected value {:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A scratch directory laid out like /sys/class/gpio with gpio5 already exported.
    async fn fake_sysfs(name: &str) -> PathBuf {
        let dir = format!("railseq-gpio-{}-{}", name, std::process::id());
        let root = std::env::temp_dir().join(dir);
        let _ = fs::remove_dir_all(&root).await;
        fs::create_dir_all(root.join("gpio5")).await.unwrap();
        root
    }

    #[tokio::test]
    async fn test_output_opens_low_and_drives_value() {
        let root = fake_sysfs("out").await;
        let mut pin = SysfsOutput::open(&root, 0, 5).await.unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio5/direction")).await.unwrap(), "low");

        pin.set(true).await.unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio5/value")).await.unwrap(), "1");
        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_input_reads_level() {
        let root = fake_sysfs("in").await;
        let mut pin = SysfsInput::open(&root, 0, 5).await.unwrap();
        fs::write(root.join("gpio5/value"), "1\n").await.unwrap();
        assert!(pin.is_high().await.unwrap());

        fs::write(root.join("gpio5/value"), "x\n").await.unwrap();
        assert!(pin.is_high().await.is_err());
        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_unexported_pin_is_exported() {
        let root = fake_sysfs("export").await;
        // no kernel behind the fake export file, so the directory never appears
        let err = SysfsOutput::open(&root, 100, 3).await.err().unwrap();
        assert_eq!(err.pin, 3);
        assert_eq!(fs::read_to_string(root.join("export")).await.unwrap(), "103");
        fs::remove_dir_all(&root).await.unwrap();
    }
}
