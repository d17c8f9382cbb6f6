use super::{Error, HidTransport, Port, Transport};
use crate::device_ids::CP2112;
use byteorder::{BE, ByteOrder, WriteBytesExt};
use hidapi::{HidApi, HidDevice};
use log::{debug, trace, warn};
use num_enum::TryFromPrimitive;
use std::time::Duration;

/// Byte-aligned SMBus address of the EFM8 SMB bootloader.
pub const BOOTLOADER_ADDRESS: u8 = 0xf0;

/// Largest payload of a single CP2112 write transfer.
pub const MAX_WRITE_SIZE: usize = 61;

pub const DEFAULT_CLOCK_HZ: u32 = 100_000;

// Bridge-side timeouts for a single transfer, in milliseconds. The bridge keeps retrying a NACKed
// address until these expire.
const WRITE_TIMEOUT_MS: u16 = 500;
const READ_TIMEOUT_MS: u16 = 500;

// CP2112 address of its own, used only when it's a slave. Irrelevant here.
const BRIDGE_OWN_ADDRESS: u8 = 0x02;

const INPUT_REPORT_SIZE: usize = 64;

/// CP2112 report IDs, from AN495.
#[repr(u8)]
#[derive(Copy, Clone, Debug)]
enum ReportId {
    SmbusConfig = 0x06,
    DataReadRequest = 0x10,
    DataReadResponse = 0x13,
    DataWrite = 0x14,
    TransferStatusRequest = 0x15,
    TransferStatusResponse = 0x16,
}

/// Coarse transfer state ("status 0") in status and read responses.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
enum TransferState {
    Idle = 0x00,
    Busy = 0x01,
    Complete = 0x02,
    Error = 0x03,
}

/// Adapter for an EFM8 bootloader on SMBus behind a CP2112 bridge.
///
/// The bootloader NACKs its address while it's busy with a frame. The bridge is configured to
/// retry the address until its own timeout, so a [read](Port::read) just blocks until the reply
/// is available or the bridge gives up.
pub struct SmbusPort<D> {
    device: Option<D>,
    address: u8,
    timeout: Duration,
}

impl SmbusPort<HidDevice> {
    /// Open the first CP2112 found and configure its SMBus clock.
    pub fn open(api: &HidApi, clock_hz: u32, timeout: Duration) -> Result<Self, Error> {
        let device = api
            .open(CP2112.vid, CP2112.pid)
            .map_err(|e| Error::DeviceIoError {
                source: e,
                action: "opening CP2112 bridge",
            })?;
        debug!("Opened CP2112 bridge {CP2112}");
        Self::new(device, clock_hz, timeout)
    }
}

impl<D: HidTransport> SmbusPort<D> {
    /// Take over a CP2112 and configure it for talking to the bootloader. `timeout` bounds how
    /// long we wait for the bridge to report back, and should be longer than the bridge's own
    /// transfer timeouts.
    pub fn new(device: D, clock_hz: u32, timeout: Duration) -> Result<Self, Error> {
        let mut config = Vec::with_capacity(14);
        config.push(ReportId::SmbusConfig as u8);
        config.write_u32::<BE>(clock_hz).unwrap();
        config.push(BRIDGE_OWN_ADDRESS);
        config.push(1); // Send read responses without being asked.
        config.write_u16::<BE>(WRITE_TIMEOUT_MS).unwrap();
        config.write_u16::<BE>(READ_TIMEOUT_MS).unwrap();
        config.push(0); // No SCL low timeout.
        config.write_u16::<BE>(0).unwrap(); // Unlimited address retries.

        device
            .send_feature_report(&config)
            .map_err(|e| Error::DeviceIoError {
                source: e,
                action: "configuring SMBus",
            })?;
        debug!("Configured SMBus at {clock_hz} Hz");

        Ok(Self {
            device: Some(device),
            address: BOOTLOADER_ADDRESS,
            timeout,
        })
    }

    fn device(&self) -> Result<&D, Error> {
        self.device.as_ref().ok_or(Error::Closed)
    }

    fn send(&self, report: &[u8], action: &'static str) -> Result<(), Error> {
        self.device()?
            .write_report(report)
            .map_err(|e| Error::DeviceIoError { source: e, action })
    }

    /// Wait for an input report with the given ID, dropping any others. Returns `None` if none
    /// arrives within the timeout.
    fn receive(
        &self,
        id: ReportId,
        buf: &mut [u8],
        action: &'static str,
    ) -> Result<Option<usize>, Error> {
        loop {
            let size = self
                .device()?
                .read_report(buf, self.timeout)
                .map_err(|e| Error::DeviceIoError { source: e, action })?;
            if size == 0 {
                return Ok(None);
            }
            if buf[0] == id as u8 {
                return Ok(Some(size));
            }
            trace!("Ignoring stray report {:#04x} while {action}", buf[0]);
        }
    }

    /// Poll transfer status until the bridge is no longer busy. A failed transfer only gets
    /// logged: the bootloader then answers the next read with an error or not at all, and that
    /// frame is counted like any other rejected one.
    fn wait_until_idle(&self) -> Result<(), Error> {
        const ACTION: &str = "polling transfer status";
        let mut report = [0u8; INPUT_REPORT_SIZE];

        loop {
            self.send(&[ReportId::TransferStatusRequest as u8, 0x01], ACTION)?;
            let size = match self.receive(ReportId::TransferStatusResponse, &mut report, ACTION)? {
                Some(size) => size,
                None => return Err(Error::NoResponse { action: ACTION }),
            };
            if size < 3 {
                return Err(Error::NoResponse { action: ACTION });
            }

            match TransferState::try_from(report[1]) {
                Ok(TransferState::Busy) => continue,
                Ok(TransferState::Idle | TransferState::Complete) => return Ok(()),
                Ok(TransferState::Error) | Err(_) => {
                    warn!(
                        "SMBus write failed (status {:#04x}, detail {:#04x})",
                        report[1], report[2]
                    );
                    return Ok(());
                }
            }
        }
    }
}

impl<D: HidTransport> Port for SmbusPort<D> {
    fn name(&self) -> &str {
        "SMB:CP2112"
    }

    fn transport(&self) -> Transport {
        Transport::Smbus
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut report = Vec::with_capacity(3 + MAX_WRITE_SIZE);
        for chunk in data.chunks(MAX_WRITE_SIZE) {
            report.clear();
            report.push(ReportId::DataWrite as u8);
            report.push(self.address);
            report.push(chunk.len() as u8);
            report.extend_from_slice(chunk);
            self.send(&report, "sending SMBus write")?;
            self.wait_until_idle()?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<u8>, Error> {
        const ACTION: &str = "reading SMBus reply";

        let mut request = [ReportId::DataReadRequest as u8, self.address, 0, 0];
        BE::write_u16(&mut request[2..], 1);
        self.send(&request, ACTION)?;

        let mut report = [0u8; INPUT_REPORT_SIZE];
        loop {
            let size = match self.receive(ReportId::DataReadResponse, &mut report, ACTION)? {
                Some(size) => size,
                None => {
                    trace!("No read response within {:?}", self.timeout);
                    return Ok(None);
                }
            };
            if size < 3 {
                trace!("Short read response ({size} bytes)");
                return Ok(None);
            }

            let state = TransferState::try_from(report[1]).ok();
            let length = (report[2] as usize).min(size.saturating_sub(3));
            if length > 0 {
                return Ok(Some(report[3]));
            }

            match state {
                Some(TransferState::Busy) => continue,
                Some(TransferState::Error) => {
                    // The bridge gave up retrying the address.
                    trace!("SMBus read failed, status {:#04x}", report[1]);
                    return Ok(None);
                }
                _ => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.device.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockHid;
    use crate::protocol::{Progress, download};
    use std::io::Cursor;

    fn status(state: u8, detail: u8) -> Vec<u8> {
        vec![0x16, state, detail, 0, 0, 0, 0]
    }

    fn port_with(device: MockHid) -> SmbusPort<MockHid> {
        SmbusPort::new(device, DEFAULT_CLOCK_HZ, Duration::from_millis(600)).unwrap()
    }

    fn written(port: &SmbusPort<MockHid>) -> Vec<Vec<u8>> {
        port.device.as_ref().unwrap().written.borrow().clone()
    }

    #[test]
    fn configures_bridge_on_open() {
        let port = port_with(MockHid::default());
        let features = port.device.as_ref().unwrap().features.borrow().clone();
        assert_eq!(
            features,
            [vec![
                0x06, 0x00, 0x01, 0x86, 0xa0, // 100 kHz
                0x02, 0x01, // own address, auto-send read
                0x01, 0xf4, 0x01, 0xf4, // 500 ms timeouts
                0x00, 0x00, 0x00,
            ]]
        );
    }

    #[test]
    fn long_frame_is_split_into_transfers() {
        let device = MockHid::default();
        for _ in 0..3 {
            device.queue_input(&status(0x02, 0x05));
        }
        let mut port = port_with(device);

        let frame: Vec<u8> = (0..130).map(|i| i as u8).collect();
        port.write(&frame).unwrap();

        let writes: Vec<Vec<u8>> = written(&port)
            .into_iter()
            .filter(|r| r[0] == 0x14)
            .collect();
        let sizes: Vec<u8> = writes.iter().map(|r| r[2]).collect();
        assert_eq!(sizes, [61, 61, 8]);
        assert!(writes.iter().all(|r| r[1] == BOOTLOADER_ADDRESS));

        let sent: Vec<u8> = writes.iter().flat_map(|r| r[3..].to_vec()).collect();
        assert_eq!(sent, frame);
    }

    #[test]
    fn write_waits_while_bridge_is_busy() {
        let device = MockHid::default();
        device.queue_input(&status(0x01, 0x03));
        device.queue_input(&[0x13, 0x00, 0x00]); // stray, ignored
        device.queue_input(&status(0x01, 0x00));
        device.queue_input(&status(0x02, 0x00));
        let mut port = port_with(device);

        port.write(&[b'$', 1, 0x30]).unwrap();

        let ids: Vec<u8> = written(&port).iter().map(|r| r[0]).collect();
        assert_eq!(ids, [0x14, 0x15, 0x15, 0x15]);
        assert!(port.device.as_ref().unwrap().input.borrow().is_empty());
    }

    #[test]
    fn failed_writes_are_not_fatal() {
        // NACK timeout, bus not free, arbitration lost, read/write incomplete.
        for detail in 0x00..=0x04 {
            let device = MockHid::default();
            device.queue_input(&status(0x03, detail));
            let mut port = port_with(device);
            port.write(&[b'$', 0]).unwrap();
        }
    }

    #[test]
    fn failed_write_counts_as_one_bad_frame() {
        let device = MockHid::default();
        device.queue_input(&status(0x02, 0x05));
        device.queue_input(&[0x13, 0x02, 0x01, b'@']);
        device.queue_input(&status(0x03, 0x04)); // write incomplete
        device.queue_input(&[0x13, 0x03, 0x00]);
        device.queue_input(&status(0x02, 0x05));
        device.queue_input(&[0x13, 0x02, 0x01, b'@']);
        let mut port = port_with(device);

        let data = [b'$', 1, 0x30, b'$', 1, 0x31, b'$', 1, 0x32];
        let mut progress = Progress(Vec::new());
        let result = download(&mut port, &mut Cursor::new(&data[..]), &mut progress).unwrap();

        assert_eq!(result.error_count, 1);
        assert_eq!(result.frames_sent, 3);
        assert_eq!(String::from_utf8(progress.0).unwrap(), "@?@\n");
    }

    #[test]
    fn missing_status_response_is_an_error() {
        let mut port = port_with(MockHid::default());
        assert!(matches!(
            port.write(&[b'$', 0]),
            Err(Error::NoResponse { .. })
        ));
    }

    #[test]
    fn read_requests_one_byte_and_returns_it() {
        let device = MockHid::default();
        device.queue_input(&[0x13, 0x02, 0x01, b'@', 0x00]);
        let mut port = port_with(device);

        assert_eq!(port.read().unwrap(), Some(b'@'));
        assert_eq!(written(&port), [vec![0x10, BOOTLOADER_ADDRESS, 0x00, 0x01]]);
    }

    #[test]
    fn read_skips_empty_busy_responses() {
        let device = MockHid::default();
        device.queue_input(&[0x13, 0x01, 0x00]);
        device.queue_input(&[0x13, 0x02, 0x01, b'C']);
        let mut port = port_with(device);
        assert_eq!(port.read().unwrap(), Some(b'C'));
    }

    #[test]
    fn short_read_response_is_no_byte() {
        let device = MockHid::default();
        device.queue_input(&[0x13, 0x01, 0x00]);
        device.queue_input(&[0x13, 0x02]);
        let mut port = port_with(device);
        assert_eq!(port.read().unwrap(), None);
    }

    #[test]
    fn read_timeout_is_no_byte() {
        let mut port = port_with(MockHid::default());
        assert_eq!(port.read().unwrap(), None);

        let device = MockHid::default();
        device.queue_input(&[0x13, 0x03, 0x00]);
        let mut port = port_with(device);
        assert_eq!(port.read().unwrap(), None);
    }

    #[test]
    fn closed_port_refuses_io() {
        let mut port = port_with(MockHid::default());
        assert_eq!(port.transport(), Transport::Smbus);
        port.close().unwrap();
        assert!(matches!(port.write(&[b'$', 0]), Err(Error::Closed)));
        assert!(matches!(port.read(), Err(Error::Closed)));
    }
}
