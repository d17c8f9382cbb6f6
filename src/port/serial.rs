use super::{Error, Port, Transport};
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// UART adapter. Bytes go through untouched; the downloader sends the auto-baud preamble itself
/// because this port reports [Transport::Uart].
pub struct SerialPort<T> {
    stream: Option<T>,
    name: String,
}

impl SerialPort<Box<dyn serialport::SerialPort>> {
    /// Open a serial device at 8N1 with `timeout` as the per-byte read timeout.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, Error> {
        let stream = serialport::new(path, baud_rate).timeout(timeout).open()?;
        debug!("Opened {path} at {baud_rate} baud, read timeout {timeout:?}");
        Ok(Self::new(stream, path))
    }
}

impl<T: Read + Write> SerialPort<T> {
    /// Wrap an already configured byte stream.
    pub fn new(stream: T, name: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            name: name.into(),
        }
    }

    fn stream(&mut self) -> Result<&mut T, Error> {
        self.stream.as_mut().ok_or(Error::Closed)
    }
}

impl<T: Read + Write> Port for SerialPort<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> Transport {
        Transport::Uart
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<u8>, Error> {
        let mut reply = [0u8; 1];
        loop {
            return match self.stream()?.read(&mut reply) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(reply[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.take();
        Ok(())
    }
}
