use super::{Error, HidTransport, Port, Transport};
use crate::device_ids::UsbId;
use hidapi::{HidApi, HidDevice};
use log::{debug, trace};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Data bytes carried by one output report of the EFM8 USB bootloader.
pub const REPORT_SIZE: usize = 64;

// The bootloader doesn't use numbered reports.
const REPORT_ID: u8 = 0;

/// USB HID adapter. Frames are cut into output reports of at most [REPORT_SIZE] bytes; the reply
/// is the first byte of the next input report.
pub struct HidPort<D> {
    device: Option<D>,
    name: String,
    report_size: usize,
    timeout: Duration,
}

impl HidPort<HidDevice> {
    /// Open the first device matching one of `ids`.
    pub fn open(api: &HidApi, ids: &[UsbId], timeout: Duration) -> Result<Self, Error> {
        let mut last_err = None;
        for id in ids {
            match api.open(id.vid, id.pid) {
                Ok(device) => {
                    debug!("Opened EFM8 HID bootloader {id}");
                    let name = format!("HID:{:04X}:{:04X}", id.vid, id.pid);
                    return Ok(Self::new(device, name, timeout));
                }
                Err(e) => {
                    trace!("No HID device {id}: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::DeviceIoError {
            source: last_err.unwrap_or(hidapi::HidError::HidApiErrorEmpty),
            action: "opening HID bootloader",
        })
    }
}

impl<D: HidTransport> HidPort<D> {
    pub fn new(device: D, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            device: Some(device),
            name: name.into(),
            report_size: REPORT_SIZE,
            timeout,
        }
    }

    /// Override the output report size, for devices whose descriptor says otherwise.
    pub fn with_report_size(mut self, report_size: NonZeroUsize) -> Self {
        self.report_size = report_size.get();
        self
    }

    fn device(&self) -> Result<&D, Error> {
        self.device.as_ref().ok_or(Error::Closed)
    }
}

impl<D: HidTransport> Port for HidPort<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> Transport {
        Transport::UsbHid
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let device = self.device()?;
        let mut report = Vec::with_capacity(1 + self.report_size);
        for chunk in data.chunks(self.report_size) {
            report.clear();
            report.push(REPORT_ID);
            report.extend_from_slice(chunk);
            device
                .write_report(&report)
                .map_err(|e| Error::DeviceIoError {
                    source: e,
                    action: "sending output report",
                })?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<u8>, Error> {
        let mut report = vec![0u8; self.report_size];
        let size = self
            .device()?
            .read_report(&mut report, self.timeout)
            .map_err(|e| Error::DeviceIoError {
                source: e,
                action: "reading input report",
            })?;

        // A read timeout comes back as an empty report.
        if size == 0 {
            trace!("No input report within {:?}", self.timeout);
            return Ok(None);
        }
        Ok(Some(report[0]))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.device.take();
        Ok(())
    }
}
