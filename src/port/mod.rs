use hidapi::{HidDevice, HidError};
use std::time::Duration;
use thiserror::Error;

/// EFM8 bootloader attached to a UART.
pub mod serial;

/// EFM8 bootloader with a USB HID interface.
pub mod hid;

/// EFM8 bootloader on an SMBus, reached through a CP2112 HID-to-SMBus bridge.
pub mod smbus;

pub use hid::HidPort;
pub use serial::SerialPort;
pub use smbus::SmbusPort;

/// Physical link behind a [Port]. The download protocol is the same on all of them except for
/// the UART auto-baud preamble.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    Uart,
    UsbHid,
    Smbus,
}

/// An open, ready channel to a bootloader.
///
/// [write](Port::write) must transmit the whole buffer, in order, before returning, however the
/// underlying link has to split it up. [read](Port::read) waits for a single reply byte for at
/// most the port's timeout and returns `Ok(None)` if nothing arrived; a timeout is never an error.
pub trait Port {
    fn name(&self) -> &str;

    fn transport(&self) -> Transport;

    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    fn read(&mut self) -> Result<Option<u8>, Error>;

    /// Release the underlying handle. Further reads and writes fail with [Error::Closed].
    fn close(&mut self) -> Result<(), Error>;
}

/// Report-level access to a HID device. Implemented for [HidDevice]; the HID and SMBus adapters
/// are written against this so they can be exercised without hardware.
pub trait HidTransport {
    /// Send an output report. `report[0]` is the report ID (0 for devices without numbered
    /// reports).
    fn write_report(&self, report: &[u8]) -> Result<(), HidError>;

    /// Wait up to `timeout` for an input report. Returns the number of bytes read, 0 on timeout.
    fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, HidError>;

    /// Send a feature report, `report[0]` being the report ID.
    fn send_feature_report(&self, report: &[u8]) -> Result<(), HidError>;
}

impl HidTransport for HidDevice {
    fn write_report(&self, report: &[u8]) -> Result<(), HidError> {
        let written = self.write(report)?;
        if written < report.len() {
            return Err(HidError::IncompleteSendError {
                sent: written,
                all: report.len(),
            });
        }
        Ok(())
    }

    fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, HidError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.read_timeout(buf, millis)
    }

    fn send_feature_report(&self, report: &[u8]) -> Result<(), HidError> {
        HidDevice::send_feature_report(self, report)
    }
}

/// I/O errors from any of the port adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("USB transaction error while {action}")]
    DeviceIoError {
        source: HidError,
        action: &'static str,
    },

    #[error("serial port error")]
    SerialError(#[from] serialport::Error),

    #[error("serial I/O error")]
    IoError(#[from] std::io::Error),

    #[error("no response from SMBus bridge while {action}")]
    NoResponse { action: &'static str },

    #[error("port is closed")]
    Closed,
}
