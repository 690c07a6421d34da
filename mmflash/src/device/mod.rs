//! Host serial port discovery.
//!
//! [`detect_ports`] enumerates the host's serial ports with their USB
//! metadata. [`locate`] narrows them down to the ports matching a
//! [`DeviceDescriptor`] and picks the one that actually answers.

pub mod locate;

#[cfg(feature = "native")]
use log::{debug, trace};

use {crate::target::board::Board, std::fmt};

pub use locate::{
    DeviceDescriptor, EnumerationOrder, PreferDescription, TieBreak, locate, probe_candidates,
};

/// Enumerated host serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
    /// Board recognised from the USB id.
    pub board: Option<Board>,
}

impl DetectedPort {
    /// A port with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
            board: None,
        }
    }

    /// Hardware id in the `VID:PID=1FC9:0093` form.
    pub fn hardware_id(&self) -> Option<String> {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => Some(format!("VID:PID={vid:04X}:{pid:04X}")),
            _ => None,
        }
    }

    /// Every text field a descriptor pattern may match.
    pub fn descriptions(&self) -> impl Iterator<Item = String> + '_ {
        [
            Some(self.name.clone()),
            self.product.clone(),
            self.manufacturer.clone(),
            self.serial.clone(),
            self.hardware_id(),
        ]
        .into_iter()
        .flatten()
    }
}

impl fmt::Display for DetectedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Enumerate host serial ports.
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort::named(info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
                detected.board = Board::from_usb_id(usb.vid, usb.pid);

                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                    detected.name, usb.vid, usb.pid
                );
            }
            detected
        })
        .collect()
}

/// Format detected ports for display, one line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let id = match (port.board, port.vid, port.pid) {
                (Some(board), ..) => format!(" [{board}]"),
                (None, Some(vid), Some(pid)) => format!(" [VID:{vid:04X} PID:{pid:04X}]"),
                _ => String::new(),
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{id}{product}", port.name)
        })
        .collect()
}
