//! I2C through the Linux i2c-dev interface.
//!
//! Transfers are `I2C_RDWR` ioctls run on the blocking pool so the
//! controller task stays responsive to its own timeouts. A write with
//! `hold_bus` set is held back and sent in the same ioctl as the read that
//! follows it, so the offset and the data phase are joined by a repeated
//! start as on any other adapter.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;

use crate::hw_trait::{I2c, TransportError};
use crate::tracing::prelude::*;

const I2C_M_RD: u16 = 0x0001;

mod sys {
    use nix::{ioctl_write_int_bad, ioctl_write_ptr_bad};

    /// `struct i2c_msg` from `<linux/i2c.h>`.
    #[repr(C)]
    pub struct I2cMsg {
        pub addr: u16,
        pub flags: u16,
        pub len: u16,
        pub buf: *mut u8,
    }

    /// `struct i2c_rdwr_ioctl_data` from `<linux/i2c-dev.h>`.
    #[repr(C)]
    pub struct I2cRdwrData {
        pub msgs: *mut I2cMsg,
        pub nmsgs: u32,
    }

    // I2C_RDWR
    ioctl_write_ptr_bad!(i2c_rdwr, 0x0707, I2cRdwrData);
    // I2C_TIMEOUT
    ioctl_write_int_bad!(i2c_set_timeout, 0x0702);
}

use sys::{i2c_rdwr, i2c_set_timeout, I2cMsg, I2cRdwrData};

fn transport_error(errno: Errno) -> TransportError {
    match errno {
        Errno::ETIMEDOUT => TransportError::Timeout,
        Errno::ENXIO | Errno::EREMOTEIO => TransportError::AddressNack,
        other => TransportError::Bus(other.desc().into()),
    }
}

/// Driver timeout, in 10 ms jiffies, for a bus timeout of `timeout`.
///
/// Kept a tenth (at least one jiffy) under the bus timeout, so the kernel
/// ends a stuck transfer before the controller stops waiting for it.
fn driver_timeout(timeout: Duration) -> i32 {
    let margin = (timeout / 10).max(Duration::from_millis(10));
    (timeout.saturating_sub(margin).as_millis() / 10).max(1) as i32
}

/// One `i2c_msg` with the buffer it points into.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Message {
    address: u8,
    flags: u16,
    data: Vec<u8>,
}

impl Message {
    fn write(address: u8, bytes: &[u8]) -> Self {
        Self {
            address,
            flags: 0,
            data: bytes.to_vec(),
        }
    }

    fn read(address: u8, len: usize) -> Self {
        Self {
            address,
            flags: I2C_M_RD,
            data: vec![0; len],
        }
    }

    fn as_raw(&mut self) -> I2cMsg {
        I2cMsg {
            addr: self.address as u16,
            flags: self.flags,
            len: self.data.len() as u16,
            buf: self.data.as_mut_ptr(),
        }
    }
}

/// Split a read of `len` bytes from `address` into ioctls.
///
/// A held write to the same device leads the read in one transfer. One
/// meant for another device is returned first, to go out on its own.
fn read_messages(
    held: Option<Message>,
    address: u8,
    len: usize,
) -> (Option<Message>, Vec<Message>) {
    let read = Message::read(address, len);
    match held {
        Some(write) if write.address == address => (None, vec![write, read]),
        other => (other, vec![read]),
    }
}

/// An open `/dev/i2c-N` adapter.
pub struct I2cDev {
    file: Arc<File>,
    path: PathBuf,
    /// Offset write waiting for its read.
    held: Option<Message>,
}

impl I2cDev {
    /// Open the adapter at `path` and set its driver timeout just under
    /// `timeout`.
    pub fn open(path: &Path, timeout: Duration) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let jiffies = driver_timeout(timeout);
        // SAFETY: the descriptor is open for the duration of the call and the
        // argument is passed by value.
        unsafe { i2c_set_timeout(file.as_raw_fd(), jiffies) }.map_err(std::io::Error::from)?;

        debug!("Opened {} ({} ms driver timeout)", path.display(), jiffies * 10);
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            held: None,
        })
    }

    // One I2C_RDWR carrying `messages`. Returns them so reads can copy out.
    async fn transfer(&self, mut messages: Vec<Message>) -> Result<Vec<Message>, TransportError> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut msgs: Vec<I2cMsg> = messages.iter_mut().map(Message::as_raw).collect();
            let request = I2cRdwrData {
                msgs: msgs.as_mut_ptr(),
                nmsgs: msgs.len() as u32,
            };
            // SAFETY: `msgs` and every buffer they point into outlive the
            // call, each `len` matches its buffer, and the kernel only writes
            // within the read buffers.
            unsafe { i2c_rdwr(file.as_raw_fd(), &request) }.map_err(transport_error)?;
            Ok(messages)
        })
        .await
        .map_err(|e| TransportError::Bus(e.to_string()))?
    }

    // Send a held write that no read picked up.
    async fn flush(&mut self) -> Result<(), TransportError> {
        if let Some(write) = self.held.take() {
            self.transfer(vec![write]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl I2c for I2cDev {
    async fn write(
        &mut self,
        address: u8,
        bytes: &[u8],
        hold_bus: bool,
    ) -> Result<usize, TransportError> {
        self.flush().await?;
        let message = Message::write(address, bytes);
        if hold_bus {
            self.held = Some(message);
        } else {
            self.transfer(vec![message]).await?;
        }
        Ok(bytes.len())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let (stray, messages) = read_messages(self.held.take(), address, buffer.len());
        if let Some(write) = stray {
            self.transfer(vec![write]).await?;
        }
        let data = match self.transfer(messages).await?.pop() {
            Some(read) => read.data,
            None => Vec::new(),
        };
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn set_frequency(&mut self, hz: u32) -> Result<(), TransportError> {
        // i2c-dev has no clock control; the adapter runs at its device-tree rate
        debug!("{}: requested {} kHz, using adapter clock", self.path.display(), hz / 1000);
        Ok(())
    }
}
