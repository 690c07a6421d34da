//! In-memory bootloader used by unit tests.
//!
//! [`MockDevice`] implements [`Port`]. Frames written to it are decoded,
//! recorded and answered according to a per-opcode [`Reply`] policy. The
//! device keeps its own baud rate: requests written while host and device
//! disagree are lost, which is how a missed baud switch shows up.

use {
    crate::{
        error::{Error, Result},
        port::{DEFAULT_BAUD, DEFAULT_TIMEOUT, Port},
        protocol::{
            Frame, Opcode,
            exchange::{STATUS_SUCCESS, response_tag},
            frame::{CRC_LEN, HEADER_LEN, PREAMBLE},
        },
    },
    std::{
        collections::{HashMap, VecDeque},
        io::{self, ErrorKind, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

/// How the device answers a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    /// Success with this payload.
    Ok(Vec<u8>),
    /// Well-formed response carrying a nonzero status.
    Status(u8),
    /// No answer at all.
    Silence,
    /// Success response with a broken CRC.
    CorruptCrc,
    /// Success response echoing another request id.
    WrongId(u8),
}

/// One decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Control-line and link events, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Dtr(bool),
    Rts(bool),
    Baud(u32),
    Clear,
    Close,
}

#[derive(Debug)]
struct State {
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    defaults: HashMap<Opcode, Reply>,
    scripted: HashMap<Opcode, VecDeque<Reply>>,
    fallback: Reply,
    requests: Vec<Request>,
    events: Vec<Event>,
    host_baud: u32,
    device_baud: u32,
    agent_baud: Option<u32>,
    timeout: Duration,
    closed: bool,
}

impl State {
    fn reply_for(&mut self, opcode: Opcode) -> Reply {
        if let Some(reply) = self.scripted.get_mut(&opcode).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.defaults
            .get(&opcode)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.inbox.extend_from_slice(bytes);

        loop {
            match self.inbox.windows(PREAMBLE.len()).position(|w| w == PREAMBLE) {
                Some(start) => {
                    self.inbox.drain(..start);
                },
                None => return,
            }
            if self.inbox.len() < HEADER_LEN {
                return;
            }
            let length = u32::from_be_bytes([
                self.inbox[12],
                self.inbox[13],
                self.inbox[14],
                self.inbox[15],
            ]) as usize;
            let total = HEADER_LEN + length + CRC_LEN;
            if self.inbox.len() < total {
                return;
            }

            let raw: Vec<u8> = self.inbox.drain(..total).collect();
            self.handle_frame(&raw);
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        if self.host_baud != self.device_baud {
            return;
        }
        let Ok(Some(frame)) = Frame::decode(&mut &raw[..]) else {
            return;
        };
        if !frame.crc_valid() {
            return;
        }
        let Some(opcode) = Opcode::from_u8(frame.tag.to_be_bytes()[3]) else {
            return;
        };

        self.requests.push(Request {
            opcode,
            payload: frame.payload.clone(),
        });

        let reply = self.reply_for(opcode);
        self.respond(opcode, reply);

        match opcode {
            Opcode::ChangeBaudrate if frame.payload.len() == 4 => {
                let mut baud = [0u8; 4];
                baud.copy_from_slice(&frame.payload);
                self.device_baud = u32::from_be_bytes(baud);
            },
            Opcode::Execute => {
                if let Some(baud) = self.agent_baud {
                    self.device_baud = baud;
                }
            },
            _ => {},
        }
    }

    fn respond(&mut self, opcode: Opcode, reply: Reply) {
        let frame = match reply {
            Reply::Silence => return,
            Reply::Ok(payload) => Frame::new(response_tag(opcode, STATUS_SUCCESS), payload),
            Reply::Status(status) => Frame::new(response_tag(opcode, status), Vec::new()),
            Reply::CorruptCrc => Frame::new(response_tag(opcode, STATUS_SUCCESS), vec![0xEE; 4])
                .map(|mut f| {
                    f.crc ^= 0x0000_0001;
                    f
                }),
            Reply::WrongId(id) => Frame::new(
                u32::from_be_bytes([0x80, STATUS_SUCCESS, 0x00, id]),
                Vec::new(),
            ),
        };
        if let Ok(frame) = frame {
            self.outbox.extend(frame.to_bytes());
        }
    }
}

/// Shared view of a [`MockDevice`], usable after the device has been moved
/// into a session.
#[derive(Debug, Clone)]
pub(crate) struct DeviceHandle(Arc<Mutex<State>>);

impl DeviceHandle {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every `opcode` request with `reply`.
    pub fn set_reply(&self, opcode: Opcode, reply: Reply) {
        self.lock().defaults.insert(opcode, reply);
    }

    /// Answer the next `opcode` request with `reply`, then fall back.
    pub fn push_reply(&self, opcode: Opcode, reply: Reply) {
        self.lock().scripted.entry(opcode).or_default().push_back(reply);
    }

    /// Make the device switch to `baud` once it executes an agent.
    pub fn set_agent_baud(&self, baud: u32) {
        self.lock().agent_baud = Some(baud);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub fn requests_for(&self, opcode: Opcode) -> Vec<Request> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.opcode == opcode)
            .cloned()
            .collect()
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.lock().requests.iter().map(|r| r.opcode).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| **e == Event::Clear)
            .count()
    }

    pub fn host_baud(&self) -> u32 {
        self.lock().host_baud
    }

    pub fn device_baud(&self) -> u32 {
        self.lock().device_baud
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Scripted bootloader.
#[derive(Debug)]
pub(crate) struct MockDevice {
    name: String,
    state: DeviceHandle,
}

impl MockDevice {
    /// Device that answers every request with success.
    pub fn new() -> Self {
        Self::named("/dev/mock0")
    }

    /// Named device that answers every request with success.
    pub fn named(name: &str) -> Self {
        Self::with_fallback(name, Reply::Ok(Vec::new()))
    }

    /// Device that never answers.
    pub fn silent() -> Self {
        Self::silent_named("/dev/mock-silent")
    }

    /// Named device that never answers.
    pub fn silent_named(name: &str) -> Self {
        Self::with_fallback(name, Reply::Silence)
    }

    fn with_fallback(name: &str, fallback: Reply) -> Self {
        init_logging();
        let state = State {
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            defaults: HashMap::new(),
            scripted: HashMap::new(),
            fallback,
            requests: Vec::new(),
            events: Vec::new(),
            host_baud: DEFAULT_BAUD,
            device_baud: DEFAULT_BAUD,
            agent_baud: None,
            timeout: DEFAULT_TIMEOUT,
            closed: false,
        };
        Self {
            name: name.to_string(),
            state: DeviceHandle(Arc::new(Mutex::new(state))),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.state.clone()
    }
}

/// Route `log` output through the test harness; honours `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn not_connected() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "mock device closed")
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(not_connected());
        }
        if state.outbox.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "mock read timed out"));
        }
        let n = buf.len().min(state.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(not_connected());
        }
        state.absorb(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.state.lock().closed {
            return Err(not_connected());
        }
        Ok(())
    }
}

impl Port for MockDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state.lock().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Io(not_connected()));
        }
        state.host_baud = baud_rate;
        state.events.push(Event::Baud(baud_rate));
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state.lock().host_baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Io(not_connected()));
        }
        state.inbox.clear();
        state.outbox.clear();
        state.events.push(Event::Clear);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.lock().events.push(Event::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.lock().events.push(Event::Rts(level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.events.push(Event::Close);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_init_is_idempotent() {
        init_logging();
        init_logging();
        log::debug!("logging ready");
    }

    #[test]
    fn test_device_records_requests() {
        let mut device = MockDevice::new();
        let handle = device.handle();
        let request = crate::protocol::frame::encode(Opcode::Sync.tag(), &[]).unwrap();

        device.write_all(&request).unwrap();

        assert_eq!(handle.opcodes(), [Opcode::Sync]);
        let mut reply = [0u8; 64];
        assert!(device.read(&mut reply).unwrap() > 0);
    }
}
