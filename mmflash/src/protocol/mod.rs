//! Serial bootloader protocol.
//!
//! ## Frame Format
//!
//! Every request and response uses the same big-endian frame:
//!
//! ```text
//! +-------------------------+--------+--------+-----------+--------+
//! |        Preamble         |  Tag   | Length |  Payload  | CRC32  |
//! +-------------------------+--------+--------+-----------+--------+
//! |         8 bytes         | 4 bytes| 4 bytes|  Length   | 4 bytes|
//! +-------------------------+--------+--------+-----------+--------+
//! | 55 55 55 55 55 55 55 5D | opcode |   n    |   data    |  CRC   |
//! +-------------------------+--------+--------+-----------+--------+
//! ```
//!
//! The CRC (CRC-32/ISO-HDLC) covers tag, length and payload. A response tag
//! carries `0x80` in its top byte, a status in the second byte (`0x00` is
//! success) and echoes the request opcode in its low byte.

pub mod crc;
pub mod exchange;
pub mod frame;
pub mod sync;
pub mod transfer;

use std::fmt;

pub use exchange::{Response, exchange};
pub use frame::{Frame, PREAMBLE};
pub use sync::{SyncConfig, Synchronizer};
pub use transfer::{Destination, EndLayout, TransferOptions, TransferSummary};

/// Largest payload carried by one DATA request.
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Baud rate the session raises to after the first handshake.
pub const HIGH_BAUD: u32 = 3_000_000;

/// Request opcodes (low byte of the request tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Handshake probe.
    Sync = 0x02,
    /// Device information query.
    Info = 0x03,
    /// ROM version query.
    Version = 0x04,
    /// Reboot the device.
    Reboot = 0x05,
    /// Jump to an address.
    Execute = 0x06,
    /// Switch the link to a new baud rate.
    ChangeBaudrate = 0x07,
    /// Start a RAM load.
    RamBegin = 0x0A,
    /// One RAM chunk.
    RamData = 0x0B,
    /// Finish a RAM load.
    RamEnd = 0x0C,
    /// Start a raw flash write.
    FlashBegin = 0x30,
    /// One flash chunk.
    FlashData = 0x31,
    /// Finish a flash write.
    FlashEnd = 0x32,
    /// Start a partition write.
    PartitionBegin = 0x38,
    /// One partition chunk.
    PartitionData = 0x39,
    /// Finish a partition write.
    PartitionEnd = 0x3A,
    /// Mark a partition bootable.
    PartitionSetBoot = 0x3B,
    /// Start a filesystem write.
    FsBegin = 0x40,
    /// One filesystem chunk.
    FsData = 0x41,
    /// Finish a filesystem write.
    FsEnd = 0x42,
}

impl Opcode {
    /// Every opcode, in wire order.
    pub const ALL: [Self; 19] = [
        Self::Sync,
        Self::Info,
        Self::Version,
        Self::Reboot,
        Self::Execute,
        Self::ChangeBaudrate,
        Self::RamBegin,
        Self::RamData,
        Self::RamEnd,
        Self::FlashBegin,
        Self::FlashData,
        Self::FlashEnd,
        Self::PartitionBegin,
        Self::PartitionData,
        Self::PartitionEnd,
        Self::PartitionSetBoot,
        Self::FsBegin,
        Self::FsData,
        Self::FsEnd,
    ];

    /// Full 32-bit request tag.
    pub fn tag(self) -> u32 {
        u32::from(self as u8)
    }

    /// Look up an opcode from the low byte of a tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == value)
    }

    /// Wire name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Info => "INFO",
            Self::Version => "VERSION",
            Self::Reboot => "REBOOT",
            Self::Execute => "EXECUTE",
            Self::ChangeBaudrate => "CHANGE_BAUDRATE",
            Self::RamBegin => "RAM_BEGIN",
            Self::RamData => "RAM_DATA",
            Self::RamEnd => "RAM_END",
            Self::FlashBegin => "FLASH_BEGIN",
            Self::FlashData => "FLASH_DATA",
            Self::FlashEnd => "FLASH_END",
            Self::PartitionBegin => "PARTITION_BEGIN",
            Self::PartitionData => "PARTITION_DATA",
            Self::PartitionEnd => "PARTITION_END",
            Self::PartitionSetBoot => "PARTITION_SET_BOOT",
            Self::FsBegin => "FS_BEGIN",
            Self::FsData => "FS_DATA",
            Self::FsEnd => "FS_END",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
