//! One-shot request/response exchange.
//!
//! [`exchange`] writes one request frame and makes exactly one decode
//! attempt under the port's current timeout. The response is then checked,
//! in order, for framing, CRC, response marker, status and request id.

use {
    crate::{
        error::{ExchangeError, ResponseFault},
        port::Port,
        protocol::{
            Opcode,
            frame::{self, Frame},
        },
    },
    log::{debug, trace},
};

/// Top tag byte of every response.
pub const RESPONSE_MARKER: u8 = 0x80;

/// Status byte meaning success.
pub const STATUS_SUCCESS: u8 = 0x00;

/// A validated, successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request this response answers.
    pub opcode: Opcode,
    /// Raw response tag.
    pub tag: u32,
    /// Response payload.
    pub payload: Vec<u8>,
}

/// Tag a device uses to answer `opcode` with `status`.
pub fn response_tag(opcode: Opcode, status: u8) -> u32 {
    u32::from_be_bytes([RESPONSE_MARKER, status, 0x00, opcode as u8])
}

/// Validate a decoded frame (or its absence) against the request it answers.
pub fn classify(opcode: Opcode, frame: Option<Frame>) -> Result<Response, ResponseFault> {
    let frame = frame.ok_or(ResponseFault::NoFrame)?;

    let expected = frame.computed_crc();
    if frame.crc != expected {
        return Err(ResponseFault::CrcMismatch {
            expected,
            actual: frame.crc,
        });
    }

    let [marker, status, _, id] = frame.tag.to_be_bytes();
    if marker != RESPONSE_MARKER {
        return Err(ResponseFault::NotAResponse);
    }
    if status != STATUS_SUCCESS {
        return Err(ResponseFault::DeviceStatus(status));
    }
    if id != opcode as u8 {
        return Err(ResponseFault::TagMismatch {
            expected: opcode as u8,
            actual: id,
        });
    }

    Ok(Response {
        opcode,
        tag: frame.tag,
        payload: frame.payload,
    })
}

/// Send one request and wait for its validated response.
///
/// A missing or malformed response is [`ExchangeError::Recoverable`]; a
/// host-side I/O failure is [`ExchangeError::Fatal`]. The caller decides
/// what a recoverable fault means.
pub fn exchange<P: Port + ?Sized>(
    port: &mut P,
    opcode: Opcode,
    payload: &[u8],
) -> Result<Response, ExchangeError> {
    let request = frame::encode(opcode.tag(), payload)?;
    trace!(
        "-> {opcode}: {} payload bytes, {} on the wire",
        payload.len(),
        request.len()
    );
    port.write_all_bytes(&request)?;

    let decoded = Frame::decode(port)?;
    match classify(opcode, decoded) {
        Ok(response) => {
            trace!("<- {opcode}: OK ({} payload bytes)", response.payload.len());
            Ok(response)
        },
        Err(fault) => {
            debug!("<- {opcode}: {fault}");
            Err(ExchangeError::Recoverable { opcode, fault })
        },
    }
}
