//! Bounded-retry SYNC handshake.
//!
//! Used after every reset and every baud change. The synchronizer is the only
//! place in the crate that retries a failed exchange.

use {
    crate::{
        error::{Error, ExchangeError, Result},
        port::Port,
        protocol::{Opcode, exchange},
    },
    log::{debug, info, warn},
    std::{thread, time::Duration},
};

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of SYNC requests before giving up.
    pub tries: u32,
    /// Read timeout applied to each attempt.
    pub attempt_timeout: Duration,
    /// Pause after a failed attempt.
    pub retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tries: 6,
            attempt_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    /// Set the number of attempts.
    #[must_use]
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
}

/// SYNC handshake driver.
pub struct Synchronizer<'a, P: Port + ?Sized> {
    port: &'a mut P,
    config: SyncConfig,
}

impl<'a, P: Port + ?Sized> Synchronizer<'a, P> {
    /// Create a synchronizer with the default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            config: SyncConfig::default(),
        }
    }

    /// Create a synchronizer with a custom configuration.
    pub fn with_config(port: &'a mut P, config: SyncConfig) -> Self {
        Self { port, config }
    }

    /// Try to synchronize.
    ///
    /// Returns `Ok(false)` when every attempt went unanswered. Only a host
    /// I/O failure is an error. The port timeout is restored afterwards.
    pub fn try_sync(&mut self) -> Result<bool> {
        let previous = self.port.timeout();
        self.port.set_timeout(self.config.attempt_timeout)?;

        let outcome = self.attempt_all();

        self.port.set_timeout(previous)?;
        outcome
    }

    /// Synchronize or fail with [`Error::SyncFailed`].
    pub fn sync(&mut self) -> Result<()> {
        if self.try_sync()? {
            Ok(())
        } else {
            Err(Error::SyncFailed {
                attempts: self.config.tries,
            })
        }
    }

    fn attempt_all(&mut self) -> Result<bool> {
        debug!(
            "Synchronizing on {} at {} baud",
            self.port.name(),
            self.port.baud_rate()
        );

        for attempt in 1..=self.config.tries {
            self.port.clear_buffers()?;

            match exchange(self.port, Opcode::Sync, &[]) {
                Ok(_) => {
                    info!("Synchronized with device (attempt {attempt}/{})", self.config.tries);
                    return Ok(true);
                },
                Err(ExchangeError::Recoverable { fault, .. }) => {
                    warn!("Sync attempt {attempt}/{} failed: {fault}", self.config.tries);
                    if attempt < self.config.tries {
                        thread::sleep(self.config.retry_delay);
                    }
                },
                Err(ExchangeError::Fatal(e)) => return Err(e),
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, Reply};

    fn fast() -> SyncConfig {
        SyncConfig {
            tries: 6,
            attempt_timeout: Duration::from_millis(5),
            retry_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.tries, 6);
        assert_eq!(config.attempt_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_sync_first_attempt() {
        let mut device = MockDevice::new();
        let handle = device.handle();

        Synchronizer::with_config(&mut device, fast()).sync().unwrap();
        assert_eq!(handle.requests_for(Opcode::Sync).len(), 1);
    }

    #[test]
    fn test_silent_device_gets_exactly_six_attempts() {
        let mut device = MockDevice::silent();
        let handle = device.handle();

        let synced = Synchronizer::with_config(&mut device, fast()).try_sync().unwrap();

        assert!(!synced);
        assert_eq!(handle.requests_for(Opcode::Sync).len(), 6);
    }

    #[test]
    fn test_sync_failure_is_error_at_top_level() {
        let mut device = MockDevice::silent();
        let err = Synchronizer::with_config(&mut device, fast().with_tries(3))
            .sync()
            .unwrap_err();
        assert!(matches!(err, Error::SyncFailed { attempts: 3 }));
    }

    #[test]
    fn test_sync_recovers_after_bad_responses() {
        let mut device = MockDevice::new();
        let handle = device.handle();
        handle.push_reply(Opcode::Sync, Reply::Silence);
        handle.push_reply(Opcode::Sync, Reply::CorruptCrc);
        handle.push_reply(Opcode::Sync, Reply::WrongId(Opcode::Info as u8));

        Synchronizer::with_config(&mut device, fast()).sync().unwrap();
        assert_eq!(handle.requests_for(Opcode::Sync).len(), 4);
    }

    #[test]
    fn test_sync_clears_buffers_and_restores_timeout() {
        let mut device = MockDevice::new();
        let handle = device.handle();
        device.set_timeout(Duration::from_secs(2)).unwrap();
        handle.push_reply(Opcode::Sync, Reply::Status(0x01));

        Synchronizer::with_config(&mut device, fast()).sync().unwrap();

        assert_eq!(device.timeout(), Duration::from_secs(2));
        assert_eq!(handle.clear_count(), 2);
    }

    #[test]
    fn test_sync_on_closed_port_is_fatal() {
        let mut device = MockDevice::new();
        device.close().unwrap();
        let err = Synchronizer::with_config(&mut device, fast()).try_sync();
        assert!(err.is_err());
    }
}
