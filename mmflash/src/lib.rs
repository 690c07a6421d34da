//! # mmflash
//!
//! A library for provisioning MadMachine boards over their serial bootloader.
//!
//! The crate drives a device from reset into its ROM listener, raises the
//! link speed, optionally stages a loader agent into RAM, and uploads a
//! payload to one of four destinations:
//!
//! - device RAM at an address
//! - raw flash at an offset
//! - a named flash partition
//! - a path on the device's mounted filesystem
//!
//! ## Layers
//!
//! - [`protocol`]: frame codec, request/response exchange, SYNC handshake
//!   and chunked transfers
//! - [`port`]: the [`Port`] abstraction and its `serialport` implementation
//! - [`device`]: host port enumeration and candidate probing
//! - [`target`]: supported boards and the [`Session`] state machine
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmflash::{ConnectTarget, Destination, Plan, Session, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plan = Plan::from_file(Destination::Flash { offset: 0 }, "firmware.bin")?;
//!
//!     let target = ConnectTarget::Port("/dev/ttyACM0".into());
//!     let session = Session::connect(&target, SessionConfig::default())?;
//!     let summary = session.run(&plan, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!
//!     println!("Wrote {} bytes, CRC32 {:#010x}", summary.bytes, summary.crc);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod target;

#[cfg(test)]
mod testing;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use {device::detect_ports, port::NativePort};
pub use {
    device::{
        DetectedPort, DeviceDescriptor, EnumerationOrder, PreferDescription, TieBreak,
        format_port_list,
    },
    error::{Error, ExchangeError, ResponseFault, Result},
    port::{Port, SerialConfig},
    protocol::{Destination, EndLayout, Opcode, SyncConfig, TransferOptions, TransferSummary},
    target::{
        AgentConfig, Board, ConnectTarget, Finish, Plan, ResetTiming, Session, SessionConfig,
        SessionState,
    },
};
