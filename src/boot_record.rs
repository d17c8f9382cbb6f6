use std::fmt::Write as _;
use std::io::Read;
use thiserror::Error;

/// Type byte every boot frame must start with.
pub const FRAME_START: u8 = b'$';

const HEADER_SIZE: usize = 2;

/// One boot record, kept exactly as it appeared in the file: a `$` type byte, a length byte and
/// `length` bytes of payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
}

impl Frame {
    /// Build a frame from a payload. Fails if the payload doesn't fit in the length byte.
    pub fn new(payload: &[u8]) -> Option<Self> {
        let length = u8::try_from(payload.len()).ok()?;
        let mut raw = Vec::with_capacity(HEADER_SIZE + payload.len());
        raw.push(FRAME_START);
        raw.push(length);
        raw.extend_from_slice(payload);
        Some(Self { raw })
    }

    pub fn frame_type(&self) -> u8 {
        self.raw[0]
    }

    pub fn length(&self) -> u8 {
        self.raw[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// Header and payload, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Up to the first 8 payload bytes as space-separated uppercase hex.
    pub fn payload_hex(&self) -> String {
        let mut out = String::new();
        for (i, b) in self.payload().iter().take(8).enumerate() {
            if i > 0 {
                out.push(' ');
            }
            write!(out, "{b:02X}").unwrap();
        }
        out
    }
}

/// Ways a boot record file can be malformed. Parsing stops at the first one.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RecordError {
    #[error("bad record header at offset {offset:#x}: type byte is {found:#04x}, expected '$'")]
    BadFrameType { offset: u64, found: u8 },

    #[error("bad record header at offset {offset:#x}: file ends inside the header")]
    PartialHeader { offset: u64 },

    #[error(
        "bad record header at offset {offset:#x}: length is {expected} bytes, only {actual} follow"
    )]
    Truncated {
        offset: u64,
        expected: u8,
        actual: usize,
    },
}

/// All errors (parse and I/O) that can happen while reading a boot record file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed boot record")]
    Record(#[from] RecordError),

    #[error("file I/O error")]
    FileIoError(#[from] std::io::Error),
}

/// Lazily splits a boot record stream into [Frame]s. Reads strictly forward and never seeks, so
/// any [Read] works. Once an error has been returned, the iterator is exhausted.
pub struct FrameReader<R> {
    file: R,
    offset: u64,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(file: R) -> Self {
        Self {
            file,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next frame in the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut raw = Vec::with_capacity(HEADER_SIZE);
        let header_size = (&mut self.file)
            .take(HEADER_SIZE as _)
            .read_to_end(&mut raw)?;

        match header_size {
            0 => return Ok(None),
            HEADER_SIZE => (),
            _ => {
                return Err(RecordError::PartialHeader {
                    offset: self.offset,
                }
                .into());
            }
        }

        if raw[0] != FRAME_START {
            return Err(RecordError::BadFrameType {
                offset: self.offset,
                found: raw[0],
            }
            .into());
        }

        let length = raw[1];
        let payload_size = (&mut self.file)
            .take(length as _)
            .read_to_end(&mut raw)?;
        if payload_size != length as usize {
            return Err(RecordError::Truncated {
                offset: self.offset,
                expected: length,
                actual: payload_size,
            }
            .into());
        }

        self.offset += raw.len() as u64;
        Ok(Some(Frame { raw }))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.read_frame().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }
}

impl<R: Read> std::iter::FusedIterator for FrameReader<R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frames(data: &[u8]) -> Vec<Result<Frame, Error>> {
        FrameReader::new(Cursor::new(data.to_vec())).collect()
    }

    #[test]
    fn well_formed_file_round_trips() {
        let data = [
            b'$', 3, 0x30, 0x00, 0x00, //
            b'$', 0, //
            b'$', 5, 0x33, 0x01, 0x02, 0x03, 0x04,
        ];
        let parsed: Vec<Frame> = frames(&data).into_iter().map(Result::unwrap).collect();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].payload(), &[0x30, 0x00, 0x00]);
        assert_eq!(parsed[2].length(), 5);

        let rebuilt: Vec<u8> = parsed.iter().flat_map(|f| f.as_bytes().to_vec()).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn empty_file_has_no_frames() {
        assert!(frames(&[]).is_empty());
    }

    #[test]
    fn zero_length_frame_is_valid() {
        let parsed = frames(&[b'$', 0]);
        assert_eq!(parsed.len(), 1);
        let frame = parsed[0].as_ref().unwrap();
        assert_eq!(frame.frame_type(), b'$');
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn wrong_type_byte_is_rejected() {
        for data in [&[0x25, 5, 1, 2, 3, 4, 5][..], &[0x25, 5][..]] {
            let parsed = frames(data);
            assert_eq!(parsed.len(), 1);
            assert!(matches!(
                parsed[0],
                Err(Error::Record(RecordError::BadFrameType { found: 0x25, .. }))
            ));
        }
    }

    #[test]
    fn short_payload_is_rejected() {
        let parsed = frames(&[b'$', 5, 1, 2, 3]);
        assert!(matches!(
            parsed[..],
            [Err(Error::Record(RecordError::Truncated {
                offset: 0,
                expected: 5,
                actual: 3
            }))]
        ));
    }

    #[test]
    fn single_header_byte_is_rejected() {
        let parsed = frames(&[b'$', 1, 0xaa, b'$']);
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_ok());
        assert!(matches!(
            parsed[1],
            Err(Error::Record(RecordError::PartialHeader { offset: 3 }))
        ));
    }

    #[test]
    fn stops_after_first_error() {
        let mut reader = FrameReader::new(Cursor::new(vec![b'#', 0, b'$', 0]));
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn payload_hex_shows_at_most_eight_bytes() {
        let frame = Frame::new(&[0x33, 0x00, 0x10, 0xab, 1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(frame.payload_hex(), "33 00 10 AB 01 02 03 04");
        assert_eq!(Frame::new(&[]).unwrap().payload_hex(), "");
    }

    #[test]
    fn oversized_payload_cannot_be_framed() {
        assert!(Frame::new(&[0u8; 256]).is_none());
        assert_eq!(Frame::new(&[0u8; 255]).unwrap().length(), 255);
    }
}
