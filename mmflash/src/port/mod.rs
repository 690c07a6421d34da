//! Port abstraction for serial communication.
//!
//! The protocol layer never talks to `serialport` directly. Everything above
//! this module is written against the [`Port`] trait, so the exchange,
//! synchronizer and session logic can be driven by a real device or by an
//! in-memory fake.
//!
//! ```text
//! +----------------------------+
//! |  Session / Transfer / Sync |
//! +-------------+--------------+
//!               |
//!               v
//! +-------------+--------------+
//! |         Port trait         |
//! +-------------+--------------+
//!               |
//!               v
//! +-------------+--------------+
//! | NativePort (serialport)    |
//! +----------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> mmflash::Result<()> {
//!     port.clear_buffers()?;
//!     port.write_all_bytes(b"\x55\x55")?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate used right after reset.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Read timeout for ordinary exchanges.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// How to open a port.
///
/// The bootloader link is always 8 data bits, no parity, one stop bit and
/// no flow control, so only the rate and the timeout are configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate` with the default timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte link to a device with modem control lines.
///
/// Reads honour the timeout set with [`Port::set_timeout`]; an expired
/// timeout surfaces as `io::ErrorKind::TimedOut`.
pub trait Port: Read + Write + Send {
    /// Change the timeout applied to subsequent reads and writes.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Timeout currently in effect.
    fn timeout(&self) -> Duration;

    /// Switch the host side of the link to `baud_rate`.
    ///
    /// Must not be called while a response is pending.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Host baud rate currently in effect.
    fn baud_rate(&self) -> u32;

    /// Discard unread input and unsent output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// OS name of the port.
    fn name(&self) -> &str;

    /// Drive the DTR line (`true` asserts it).
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive the RTS line (`true` asserts it).
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Release the OS handle.
    ///
    /// Closing twice is harmless. After closing, all I/O fails with
    /// `NotConnected`.
    fn close(&mut self) -> Result<()>;

    /// Write and flush `buf` in full.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
