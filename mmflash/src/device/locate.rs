//! Port selection.
//!
//! Locating a device is two steps: [`locate`] filters enumerated ports by a
//! [`DeviceDescriptor`], then [`probe_candidates`] tries the survivors in
//! [`TieBreak`] order and keeps the first one that answers.
//!
//! Composite USB devices can expose two ports with near-identical
//! descriptions, and which one carries the bootloader depends on host driver
//! naming. That is why ordering is a policy rather than a fixed rule.

use {
    super::DetectedPort,
    crate::{
        error::{Error, Result},
        port::Port,
    },
    log::{debug, info, warn},
    std::fmt,
};

/// What to look for among host ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Case-insensitive substring matched against a port's name, product,
    /// manufacturer, serial number and hardware id. Empty matches any port.
    pub pattern: String,
    /// Required USB vendor id.
    pub vid: Option<u16>,
    /// Required USB product id.
    pub pid: Option<u16>,
}

impl DeviceDescriptor {
    /// Descriptor matching a description pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            vid: None,
            pid: None,
        }
    }

    /// Also require a USB VID/PID pair.
    #[must_use]
    pub fn with_usb_id(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    /// Whether `port` fits this descriptor.
    pub fn matches(&self, port: &DetectedPort) -> bool {
        if self.vid.is_some_and(|vid| port.vid != Some(vid))
            || self.pid.is_some_and(|pid| port.pid != Some(pid))
        {
            return false;
        }
        if self.pattern.is_empty() {
            return true;
        }

        let needle = self.pattern.to_lowercase();
        port.descriptions()
            .any(|text| text.to_lowercase().contains(&needle))
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.pattern)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " ({vid:04X}:{pid:04X})")?;
        }
        Ok(())
    }
}

/// Ordering policy applied to several matching ports before probing.
pub trait TieBreak {
    /// Reorder `candidates` in place; the first is probed first.
    fn order(&self, candidates: &mut Vec<DetectedPort>);
}

/// Keep the host's enumeration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerationOrder;

impl TieBreak for EnumerationOrder {
    fn order(&self, _candidates: &mut Vec<DetectedPort>) {}
}

/// Probe ports whose description contains a substring first.
#[derive(Debug, Clone)]
pub struct PreferDescription(pub String);

impl TieBreak for PreferDescription {
    fn order(&self, candidates: &mut Vec<DetectedPort>) {
        let needle = self.0.to_lowercase();
        // Stable: preferred ports keep their relative order.
        candidates.sort_by_key(|port| {
            !port
                .descriptions()
                .any(|text| text.to_lowercase().contains(&needle))
        });
    }
}

/// Ports matching `descriptor`, ordered by `tie_break`.
///
/// Zero matches is [`Error::NoMatchingPort`].
pub fn locate(
    descriptor: &DeviceDescriptor,
    ports: Vec<DetectedPort>,
    tie_break: &dyn TieBreak,
) -> Result<Vec<DetectedPort>> {
    let mut matched: Vec<_> = ports
        .into_iter()
        .filter(|port| descriptor.matches(port))
        .collect();

    if matched.is_empty() {
        return Err(Error::NoMatchingPort(descriptor.to_string()));
    }
    if matched.len() > 1 {
        tie_break.order(&mut matched);
        debug!(
            "{} ports match {descriptor}: {}",
            matched.len(),
            matched
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    } else {
        info!("Found {descriptor} at {}", matched[0].name);
    }

    Ok(matched)
}

/// Try candidates in order and keep the first live one.
///
/// `open` opens a candidate; `probe` returns whether it answered. A
/// candidate that fails to open, fails its probe, or errors while probing
/// is closed and skipped. Returns the winning candidate and its open port,
/// or [`Error::NoLiveCandidate`] once every candidate has been tried.
pub fn probe_candidates<'a, T, P, O, F>(
    candidates: &'a [T],
    mut open: O,
    mut probe: F,
) -> Result<(&'a T, P)>
where
    T: fmt::Display,
    P: Port,
    O: FnMut(&T) -> Result<P>,
    F: FnMut(&mut P) -> Result<bool>,
{
    for candidate in candidates {
        let mut port = match open(candidate) {
            Ok(port) => port,
            Err(e) => {
                warn!("Skipping {candidate}: {e}");
                continue;
            },
        };

        match probe(&mut port) {
            Ok(true) => {
                info!("Device answered on {candidate}");
                return Ok((candidate, port));
            },
            Ok(false) => warn!("No answer on {candidate}"),
            Err(e) => warn!("Probing {candidate} failed: {e}"),
        }

        if let Err(e) = port.close() {
            debug!("Closing {candidate} failed: {e}");
        }
    }

    Err(Error::NoLiveCandidate {
        count: candidates.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, exchange};
    use crate::testing::MockDevice;
    use std::collections::HashMap;

    fn port(name: &str, product: &str) -> DetectedPort {
        DetectedPort {
            product: Some(product.to_string()),
            ..DetectedPort::named(name)
        }
    }

    #[test]
    fn test_descriptor_matches_case_insensitive() {
        let descriptor = DeviceDescriptor::new("daplink");
        assert!(descriptor.matches(&port("/dev/ttyACM0", "DAPLink CMSIS-DAP")));
        assert!(!descriptor.matches(&port("/dev/ttyUSB0", "USB Single Serial")));
    }

    #[test]
    fn test_descriptor_matches_name_and_hardware_id() {
        let mut candidate = DetectedPort::named("/dev/ttyACM0");
        assert!(DeviceDescriptor::new("/dev/ttyACM0").matches(&candidate));

        candidate.vid = Some(0x1FC9);
        candidate.pid = Some(0x0095);
        assert!(DeviceDescriptor::new("1fc9:0095").matches(&candidate));
    }

    #[test]
    fn test_descriptor_usb_id_filter() {
        let mut candidate = port("COM3", "USB Single Serial");
        let descriptor = DeviceDescriptor::new("").with_usb_id(0x1A86, 0x7523);
        assert!(!descriptor.matches(&candidate));

        candidate.vid = Some(0x1A86);
        candidate.pid = Some(0x7523);
        assert!(descriptor.matches(&candidate));
    }

    #[test]
    fn test_locate_zero_matches_is_error() {
        let ports = vec![port("/dev/ttyS0", "16550A")];
        let err = locate(&DeviceDescriptor::new("wch"), ports, &EnumerationOrder).unwrap_err();
        assert!(matches!(err, Error::NoMatchingPort(_)));
    }

    #[test]
    fn test_locate_filters_and_keeps_order() {
        let ports = vec![
            port("/dev/ttyUSB0", "USB Single Serial"),
            port("/dev/ttyS0", "16550A"),
            port("/dev/ttyUSB1", "USB Single Serial"),
        ];
        let found = locate(
            &DeviceDescriptor::new("single serial"),
            ports,
            &EnumerationOrder,
        )
        .unwrap();
        let names: Vec<_> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_prefer_description_tie_break() {
        let ports = vec![
            port("COM3", "DAPLink CMSIS-DAP (Interface 0)"),
            port("COM4", "DAPLink CMSIS-DAP (Interface 1)"),
            port("COM5", "DAPLink CMSIS-DAP (Interface 1)"),
        ];
        let found = locate(
            &DeviceDescriptor::new("DAPLink"),
            ports,
            &PreferDescription("interface 1".into()),
        )
        .unwrap();
        let names: Vec<_> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["COM4", "COM5", "COM3"]);
    }

    fn devices(live: &[&str], dead: &[&str]) -> HashMap<String, MockDevice> {
        live.iter()
            .map(|name| (name.to_string(), MockDevice::named(name)))
            .chain(
                dead.iter()
                    .map(|name| (name.to_string(), MockDevice::silent_named(name))),
            )
            .collect()
    }

    #[test]
    fn test_probe_keeps_first_live_candidate() {
        let candidates = [
            DetectedPort::named("a"),
            DetectedPort::named("b"),
            DetectedPort::named("c"),
        ];
        let mut pool = devices(&["b", "c"], &["a"]);
        let handles: HashMap<_, _> = pool.iter().map(|(k, v)| (k.clone(), v.handle())).collect();

        let (winner, port) = probe_candidates(
            &candidates,
            |c| Ok(pool.remove(&c.name).unwrap()),
            |p| Ok(exchange(p, Opcode::Sync, &[]).is_ok()),
        )
        .unwrap();

        assert_eq!(winner.name, "b");
        assert_eq!(port.name(), "b");
        assert!(handles["a"].is_closed());
        assert!(!handles["b"].is_closed());
        assert!(handles["c"].requests().is_empty());
    }

    #[test]
    fn test_probe_no_live_candidate() {
        let candidates = [DetectedPort::named("a"), DetectedPort::named("b")];
        let mut pool = devices(&[], &["a", "b"]);
        let handles: Vec<_> = pool.values().map(MockDevice::handle).collect();

        let err = probe_candidates(
            &candidates,
            |c| Ok(pool.remove(&c.name).unwrap()),
            |_| Ok(false),
        )
        .unwrap_err();

        assert!(matches!(err, Error::NoLiveCandidate { count: 2 }));
        assert!(handles.iter().all(|h| h.is_closed()));
    }

    #[test]
    fn test_probe_skips_candidates_that_fail_to_open() {
        let candidates = [DetectedPort::named("busy"), DetectedPort::named("ok")];

        let (winner, _port) = probe_candidates(
            &candidates,
            |c| {
                if c.name == "busy" {
                    Err(Error::Io(std::io::Error::other("port busy")))
                } else {
                    Ok(MockDevice::named(&c.name))
                }
            },
            |_| Ok(true),
        )
        .unwrap();

        assert_eq!(winner.name, "ok");
    }
}
