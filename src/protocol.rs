use crate::boot_record::{self, Frame, FrameReader};
use crate::port::{self, Port, Transport};
use log::{debug, info, trace};
use num_enum::TryFromPrimitive;
use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Sent once before the first frame so a UART bootloader can measure the baud rate.
pub const AUTOBAUD_PREAMBLE: [u8; 2] = [0xff, 0xff];

/// Reply byte a bootloader sends after each frame. Only [Reply::Ack] means the frame was
/// accepted; what `A`, `B` and `C` mean is up to the bootloader, and they all count as errors.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Reply {
    Ack = b'@',
    ErrorA = b'A',
    ErrorB = b'B',
    ErrorC = b'C',
    /// No reply before the timeout, or a byte outside the ones above.
    Unrecognized = b'?',
}

impl Reply {
    /// Classify what the port returned. `None` means the read timed out.
    pub fn from_byte(byte: Option<u8>) -> Self {
        byte.and_then(|b| Self::try_from(b).ok()).unwrap_or(Reply::Unrecognized)
    }

    /// Character shown for this reply: the byte itself, or `?` if it wasn't recognised.
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    pub fn is_ack(self) -> bool {
        self == Reply::Ack
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Outcome of a download that ran through the whole file.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DownloadResult {
    /// Frames that got anything other than [Reply::Ack].
    pub error_count: usize,
    pub frames_sent: usize,
}

/// Receives one notification per frame sent, in order.
pub trait Reporter {
    fn frame_done(&mut self, frame: &Frame, reply: Reply) -> std::io::Result<()>;

    /// Called once after the last frame of a complete download.
    fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Prints one reply character per frame, flushing after each, and a newline at the end.
pub struct Progress<W: Write>(pub W);

impl<W: Write> Reporter for Progress<W> {
    fn frame_done(&mut self, _frame: &Frame, reply: Reply) -> std::io::Result<()> {
        write!(self.0, "{reply}")?;
        self.0.flush()
    }

    fn finish(&mut self) -> std::io::Result<()> {
        writeln!(self.0)?;
        self.0.flush()
    }
}

/// Prints a line per frame: type character, first payload bytes in hex, and the reply.
pub struct Trace<W: Write>(pub W);

impl<W: Write> Reporter for Trace<W> {
    fn frame_done(&mut self, frame: &Frame, reply: Reply) -> std::io::Result<()> {
        writeln!(
            self.0,
            "{} {} -> {reply}",
            frame.frame_type() as char,
            frame.payload_hex()
        )?;
        self.0.flush()
    }
}

/// Send a frame and wait for the bootloader's reply.
pub fn send_frame(port: &mut (impl Port + ?Sized), frame: &Frame) -> Result<Reply, port::Error> {
    port.write(frame.as_bytes())?;
    let reply = Reply::from_byte(port.read()?);
    trace!(
        "Sent {}-byte frame {}, reply {reply}",
        frame.as_bytes().len(),
        frame.payload_hex()
    );
    Ok(reply)
}

/// Download every frame in `file` to the bootloader behind `port`.
///
/// A frame that isn't acknowledged doesn't stop the download; it's counted in the result. A
/// malformed record, a port I/O failure or a failure writing to `reporter` does stop it, leaving
/// whatever was already sent in place.
pub fn download(
    port: &mut (impl Port + ?Sized),
    file: &mut impl Read,
    reporter: &mut impl Reporter,
) -> Result<DownloadResult, Error> {
    download_with_cancel(port, file, reporter, &AtomicBool::new(false))
}

/// Like [download], but checks `cancel` before each frame and stops with [Error::Interrupted]
/// once it's set.
pub fn download_with_cancel(
    port: &mut (impl Port + ?Sized),
    file: &mut impl Read,
    reporter: &mut impl Reporter,
    cancel: &AtomicBool,
) -> Result<DownloadResult, Error> {
    let mut result = DownloadResult::default();

    if port.transport() == Transport::Uart {
        debug!("Sending auto-baud preamble");
        port.write(&AUTOBAUD_PREAMBLE)?;
    }

    for frame in FrameReader::new(file) {
        let frame = frame?;
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Interrupted {
                frames_sent: result.frames_sent,
            });
        }

        let reply = send_frame(port, &frame)?;
        result.frames_sent += 1;
        if !reply.is_ack() {
            result.error_count += 1;
        }

        reporter
            .frame_done(&frame, reply)
            .map_err(Error::OutputIoError)?;
    }

    reporter.finish().map_err(Error::OutputIoError)?;
    info!(
        "Sent {} frames over {}, {} errors",
        result.frames_sent,
        port.name(),
        result.error_count
    );
    Ok(result)
}

/// All errors that stop a download.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("unable to parse boot record file")]
    BootRecord(#[from] boot_record::Error),

    #[error("port I/O error")]
    Port(#[from] port::Error),

    #[error("error writing download output")]
    OutputIoError(#[source] std::io::Error),

    #[error("download interrupted after {frames_sent} frames")]
    Interrupted { frames_sent: usize },
}
