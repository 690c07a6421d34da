//! Frame encoding and decoding.
//!
//! The codec is a pure (de)serializer: it never validates the CRC. That is
//! left to the exchange layer, which decides what a bad frame means.

use {
    crate::{
        error::{Error, Result},
        protocol::{MAX_CHUNK_SIZE, crc::crc32_parts},
    },
    byteorder::{BigEndian, ByteOrder, WriteBytesExt},
    log::{debug, trace},
    std::io::{self, ErrorKind, Read},
};

/// Fixed frame preamble.
pub const PREAMBLE: [u8; 8] = [0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x5D];

/// Preamble + tag + length.
pub const HEADER_LEN: usize = 16;

/// Trailing CRC size.
pub const CRC_LEN: usize = 4;

/// Largest payload `decode` accepts. Anything longer is treated as a
/// corrupted header rather than an allocation request.
pub const MAX_DECODED_PAYLOAD: usize = 4 * MAX_CHUNK_SIZE;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 32-bit tag (opcode for requests; marker/status/echo for responses).
    pub tag: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// CRC carried on the wire.
    pub crc: u32,
}

impl Frame {
    /// Build a frame with a correct CRC.
    pub fn new(tag: u32, payload: Vec<u8>) -> Result<Self> {
        let length = payload_len(&payload)?;
        let crc = frame_crc(tag, length, &payload);
        Ok(Self { tag, payload, crc })
    }

    /// Payload length as carried in the length field.
    #[allow(clippy::cast_possible_truncation)] // Checked in `new`/`decode`
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// CRC over tag, length and payload as they are now.
    pub fn computed_crc(&self) -> u32 {
        frame_crc(self.tag, self.length(), &self.payload)
    }

    /// Whether the carried CRC matches the content.
    pub fn crc_valid(&self) -> bool {
        self.crc == self.computed_crc()
    }

    /// Serialize, keeping the carried CRC as is.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.extend_from_slice(&PREAMBLE);
        buf.extend_from_slice(&self.tag.to_be_bytes());
        buf.extend_from_slice(&self.length().to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.crc.to_be_bytes());
        buf
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` on a short read or a preamble mismatch; those are
    /// recoverable. Only a hard I/O failure (port gone) is an error.
    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(reader, &mut header)?;
        if got != HEADER_LEN {
            debug!("Short header: got {got} of {HEADER_LEN} bytes");
            return Ok(None);
        }
        trace!("Header: {header:02X?}");

        if header[..PREAMBLE.len()] != PREAMBLE {
            debug!("Preamble mismatch: {:02X?}", &header[..PREAMBLE.len()]);
            return Ok(None);
        }

        let tag = BigEndian::read_u32(&header[8..12]);
        let length = BigEndian::read_u32(&header[12..16]) as usize;
        if length > MAX_DECODED_PAYLOAD {
            debug!("Implausible payload length {length}");
            return Ok(None);
        }

        let mut rest = vec![0u8; length + CRC_LEN];
        let got = read_full(reader, &mut rest)?;
        if got != rest.len() {
            debug!("Short body: need {} received {got}", rest.len());
            return Ok(None);
        }

        let crc = BigEndian::read_u32(&rest[length..]);
        rest.truncate(length);

        Ok(Some(Self {
            tag,
            payload: rest,
            crc,
        }))
    }
}

/// Encode a frame: `preamble || tag || len || payload || crc32`, all big-endian.
pub fn encode(tag: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let length = payload_len(payload)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    buf.extend_from_slice(&PREAMBLE);
    buf.write_u32::<BigEndian>(tag)?;
    buf.write_u32::<BigEndian>(length)?;
    buf.extend_from_slice(payload);
    buf.write_u32::<BigEndian>(frame_crc(tag, length, payload))?;
    Ok(buf)
}

fn frame_crc(tag: u32, length: u32, payload: &[u8]) -> u32 {
    crc32_parts(&[&tag.to_be_bytes(), &length.to_be_bytes(), payload])
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len()).map_err(|_| {
        Error::InvalidArgument(format!("payload of {} bytes does not fit a frame", payload.len()))
    })
}

/// Fill `buf` from `reader` until it is full, the reader reports EOF, or a
/// read times out. Returns the number of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
