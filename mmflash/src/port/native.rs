//! [`Port`] over an OS serial device, backed by the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        fmt, io,
        io::{Read, Write},
        time::Duration,
    },
};

/// An open host serial port.
///
/// The OS handle is released on [`Port::close`] or when the value is dropped,
/// whichever comes first. Control-line and configuration calls on a closed
/// port only update the cached settings.
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        debug!(
            "Opened {} at {} baud (timeout {:?})",
            config.port_name, config.baud_rate, config.timeout
        );

        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Whether the OS handle is still held.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn io(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl fmt::Debug for NativePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativePort")
            .field("name", &self.name)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.set_baud_rate(baud_rate)?;
        }
        trace!("{}: baud rate {} -> {baud_rate}", self.name, self.baud_rate);
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR={level}", self.name);
        if let Some(handle) = self.handle.as_mut() {
            handle.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS={level}", self.name);
        if let Some(handle) = self.handle.as_mut() {
            handle.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io()?.flush()
    }
}
