//! Error types for mmflash.

use crate::protocol::Opcode;
use crate::target::session::SessionState;
use std::io;
use thiserror::Error;

/// Result type for mmflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mmflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No host port matched the device descriptor.
    #[error("No serial port matches {0}")]
    NoMatchingPort(String),

    /// Several ports matched but none of them answered the handshake.
    #[error("{count} candidate ports matched but none answered the handshake")]
    NoLiveCandidate {
        /// Number of candidates probed.
        count: usize,
    },

    /// A request was answered badly or not at all.
    #[error("{opcode} failed: {fault}")]
    InvalidResponse {
        /// Request that failed.
        opcode: Opcode,
        /// What was wrong with the response.
        fault: ResponseFault,
    },

    /// Synchronization did not succeed within the retry budget.
    #[error("Serial port synchronization failed after {attempts} attempts")]
    SyncFailed {
        /// Number of SYNC requests sent.
        attempts: u32,
    },

    /// Invalid caller-supplied argument (name too long, file too large, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A provisioning run aborted.
    #[error("Provisioning aborted while {state}: {source}")]
    StepFailed {
        /// State the session was in when the failure happened.
        state: SessionState,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The innermost error, skipping `StepFailed` wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Why a response was rejected.
///
/// Framing, integrity and protocol faults all collapse into this one type;
/// callers treat every variant the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResponseFault {
    /// Nothing decodable arrived before the read timeout (short read or bad preamble).
    #[error("no valid frame received")]
    NoFrame,

    /// Trailing CRC does not cover the decoded tag, length and payload.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC computed over the received bytes.
        expected: u32,
        /// CRC carried by the frame.
        actual: u32,
    },

    /// Top tag byte lacks the response marker.
    #[error("frame is not a response")]
    NotAResponse,

    /// Device reported a nonzero status.
    #[error("device reported status {0:#04x}")]
    DeviceStatus(u8),

    /// Response echoes a different request id.
    #[error("response id {actual:#04x} does not match request {expected:#04x}")]
    TagMismatch {
        /// Low byte of the request tag.
        expected: u8,
        /// Low byte of the response tag.
        actual: u8,
    },
}

/// Outcome of a failed exchange.
///
/// `Recoverable` faults may be retried; only the synchronizer does so.
/// Everything else escalates through `From<ExchangeError> for Error`.
#[derive(Debug)]
pub enum ExchangeError {
    /// Bad or missing response, eligible for a retry.
    Recoverable {
        /// Request that was sent.
        opcode: Opcode,
        /// What went wrong.
        fault: ResponseFault,
    },
    /// Host-side failure; abort.
    Fatal(Error),
}

impl From<ExchangeError> for Error {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Recoverable { opcode, fault } => Self::InvalidResponse { opcode, fault },
            ExchangeError::Fatal(e) => e,
        }
    }
}

impl From<io::Error> for ExchangeError {
    fn from(err: io::Error) -> Self {
        Self::Fatal(Error::Io(err))
    }
}

impl From<Error> for ExchangeError {
    fn from(err: Error) -> Self {
        Self::Fatal(err)
    }
}
