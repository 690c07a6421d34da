//! Supported boards.

use {
    crate::{device::locate::DeviceDescriptor, error::Error},
    std::{fmt, str::FromStr},
};

/// MadMachine USB vendor id.
pub const MADMACHINE_VID: u16 = 0x1FC9;

/// Board families the tool knows how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Board {
    /// SwiftIO Board (on-board DAPLink bridge).
    #[cfg_attr(feature = "serde", serde(rename = "SwiftIOBoard"))]
    SwiftIoBoard,
    /// SwiftIO Micro (WCH bridge, CDC-ACM on Linux).
    #[cfg_attr(feature = "serde", serde(rename = "SwiftIOMicro"))]
    SwiftIoMicro,
    /// Any board behind a generic USB serial bridge.
    Generic,
}

impl Board {
    /// Every board, in lookup order.
    pub const ALL: [Self; 3] = [Self::SwiftIoBoard, Self::SwiftIoMicro, Self::Generic];

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::SwiftIoBoard => "SwiftIOBoard",
            Self::SwiftIoMicro => "SwiftIOMicro",
            Self::Generic => "Generic",
        }
    }

    /// Parse a board name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|board| board.name().eq_ignore_ascii_case(name.trim()))
    }

    /// USB VID/PID of the board's own USB function, when it has one.
    pub fn usb_id(self) -> Option<(u16, u16)> {
        match self {
            Self::SwiftIoBoard => Some((MADMACHINE_VID, 0x0093)),
            Self::SwiftIoMicro => Some((MADMACHINE_VID, 0x0095)),
            Self::Generic => None,
        }
    }

    /// Identify a board from a USB VID/PID pair.
    pub fn from_usb_id(vid: u16, pid: u16) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|board| board.usb_id() == Some((vid, pid)))
    }

    /// Description of the serial bridge the bootloader is reached through.
    pub fn serial_bridge(self) -> &'static str {
        match self {
            Self::SwiftIoBoard => "DAPLink CMSIS-DAP",
            Self::SwiftIoMicro if cfg!(target_os = "linux") => "/dev/ttyACM0",
            Self::SwiftIoMicro => "wch",
            Self::Generic => "USB Single Serial",
        }
    }

    /// Image file name the board boots from its filesystem.
    pub fn image_name(self) -> &'static str {
        match self {
            Self::SwiftIoMicro => "micro.img",
            Self::SwiftIoBoard | Self::Generic => "swiftio.bin",
        }
    }

    /// Filesystem path the board boots its image from.
    pub fn image_path(self) -> String {
        format!("/SD:/{}", self.image_name())
    }

    /// Descriptor matching the board's serial bridge.
    ///
    /// The bridge is matched by description only: its VID/PID belong to the
    /// bridge chip, not to the board.
    pub fn descriptor(self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.serial_bridge())
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<_> = Self::ALL.iter().map(|b| b.name()).collect();
            Error::Config(format!("unknown board '{s}' (known: {})", known.join(", ")))
        })
    }
}
