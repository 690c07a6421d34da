//! Provisioning session.
//!
//! A [`Session`] owns the open port for one provisioning run and walks the
//! device through:
//!
//! ```text
//! Idle -> Reset -> SyncedLowBaud -> BaudRaised -> SyncedHighBaud
//!      -> [AgentStaged] -> TransferInProgress -> Finalized -> Rebooted
//! ```
//!
//! The first failing step moves the session to [`SessionState::Failed`],
//! which is terminal. The error is reported as [`Error::StepFailed`] naming
//! the step that was being entered. The port is closed when the session is
//! dropped, whatever the outcome.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmflash::{Board, Destination, Plan, SessionConfig};
//!
//! fn main() -> mmflash::Result<()> {
//!     let image = std::fs::read("swiftio.bin")?;
//!     let plan = Plan::new(
//!         Destination::Filesystem { path: "/SD:/swiftio.bin".into() },
//!         image,
//!     );
//!
//!     let config = SessionConfig::default()
//!         .with_agent(mmflash::AgentConfig::from_file("agent.bin", 0x2020_0000)?);
//!     let target = mmflash::ConnectTarget::Board(Board::SwiftIoBoard);
//!     let session = mmflash::Session::connect(&target, config)?;
//!     session.run(&plan, |sent, total| println!("{sent}/{total}"))?;
//!     Ok(())
//! }
//! ```

use {
    crate::{
        device::probe_candidates,
        error::{Error, Result},
        port::{DEFAULT_BAUD, Port},
        protocol::{
            self, Destination, HIGH_BAUD, Opcode, SyncConfig, Synchronizer, TransferOptions,
            TransferSummary, exchange, frame,
        },
    },
    log::{debug, info, trace, warn},
    std::{fmt, fs, path::Path, thread, time::Duration},
};

/// Where a session is in the provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Port open, nothing sent.
    Idle,
    /// Control lines driven into the download combination.
    Reset,
    /// Handshake done at the initial baud.
    SyncedLowBaud,
    /// CHANGE_BAUDRATE sent, host switched.
    BaudRaised,
    /// Handshake done at the high baud.
    SyncedHighBaud,
    /// Loader agent running and answering.
    AgentStaged,
    /// A chunked transfer is underway (or has just completed).
    TransferInProgress,
    /// Post-transfer steps done.
    Finalized,
    /// REBOOT acknowledged.
    Rebooted,
    /// Execution handed to a RAM image.
    Running,
    /// A step failed; terminal.
    Failed,
}

impl SessionState {
    /// Whether no further step may run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rebooted | Self::Running | Self::Failed)
    }

    /// Whether the device has answered a handshake and can take requests.
    pub fn is_synced(self) -> bool {
        matches!(
            self,
            Self::SyncedLowBaud
                | Self::SyncedHighBaud
                | Self::AgentStaged
                | Self::TransferInProgress
                | Self::Finalized
        )
    }

    /// Whether a step may move the session from `self` to `next`.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Idle | Self::Failed => false,
            Self::Reset => true,
            Self::SyncedLowBaud => matches!(self, Self::Reset | Self::SyncedLowBaud),
            Self::BaudRaised => self == Self::SyncedLowBaud,
            // Re-entering covers a link already at the high rate.
            Self::SyncedHighBaud => matches!(
                self,
                Self::SyncedLowBaud | Self::BaudRaised | Self::SyncedHighBaud
            ),
            Self::AgentStaged => matches!(self, Self::SyncedLowBaud | Self::SyncedHighBaud),
            Self::TransferInProgress => matches!(
                self,
                Self::SyncedLowBaud
                    | Self::SyncedHighBaud
                    | Self::AgentStaged
                    | Self::TransferInProgress
            ),
            Self::Finalized => self == Self::TransferInProgress,
            Self::Rebooted | Self::Running => self.is_synced(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Reset => "resetting into the bootloader",
            Self::SyncedLowBaud => "synchronizing at the initial baud rate",
            Self::BaudRaised => "raising the baud rate",
            Self::SyncedHighBaud => "synchronizing at the high baud rate",
            Self::AgentStaged => "staging the loader agent",
            Self::TransferInProgress => "transferring",
            Self::Finalized => "finalizing",
            Self::Rebooted => "rebooting",
            Self::Running => "starting the RAM image",
            Self::Failed => "failed",
        })
    }
}

/// Control-line timing for the reset-to-download pattern.
#[derive(Debug, Clone)]
pub struct ResetTiming {
    /// How long the device is held in reset.
    pub hold: Duration,
    /// Release pulse with the boot-select line asserted.
    pub pulse: Duration,
    /// Wait for the ROM listener after releasing both lines.
    pub settle: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            hold: Duration::from_millis(500),
            pulse: Duration::from_millis(50),
            settle: Duration::from_millis(50),
        }
    }
}

impl ResetTiming {
    /// No delays. For tests and simulated links.
    pub fn immediate() -> Self {
        Self {
            hold: Duration::ZERO,
            pulse: Duration::ZERO,
            settle: Duration::ZERO,
        }
    }
}

/// Second-stage loader staged into RAM before partition and filesystem
/// writes.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent image.
    pub image: Vec<u8>,
    /// RAM address the image is loaded to and started at.
    pub load_address: u64,
    /// Baud rate the agent comes up at, if it differs from the link rate.
    pub baud: Option<u32>,
}

impl AgentConfig {
    /// Agent from an in-memory image.
    pub fn new(image: Vec<u8>, load_address: u64) -> Self {
        Self {
            image,
            load_address,
            baud: None,
        }
    }

    /// Agent read from disk.
    pub fn from_file(path: impl AsRef<Path>, load_address: u64) -> Result<Self> {
        let path = path.as_ref();
        let image = fs::read(path)?;
        debug!("Loaded agent {} ({} bytes)", path.display(), image.len());
        Ok(Self::new(image, load_address))
    }

    /// Set the agent's own baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Baud rate the ROM listener starts at.
    pub initial_baud: u32,
    /// Baud rate requested after the first handshake.
    pub high_baud: u32,
    /// Handshake policy.
    pub sync: SyncConfig,
    /// Reset pattern timing.
    pub reset: ResetTiming,
    /// Transfer tuning.
    pub transfer: TransferOptions,
    /// Loader agent, required for partition and filesystem destinations.
    pub agent: Option<AgentConfig>,
    /// Pause around a baud switch so in-flight bytes drain.
    pub baud_settle: Duration,
    /// Pause after EXECUTE before talking to the agent.
    pub execute_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_baud: DEFAULT_BAUD,
            high_baud: HIGH_BAUD,
            sync: SyncConfig::default(),
            reset: ResetTiming::default(),
            transfer: TransferOptions::default(),
            agent: None,
            baud_settle: Duration::from_millis(10),
            execute_settle: Duration::from_millis(100),
        }
    }
}

impl SessionConfig {
    /// Set the high baud rate.
    #[must_use]
    pub fn with_high_baud(mut self, baud: u32) -> Self {
        self.high_baud = baud;
        self
    }

    /// Set the loader agent.
    #[must_use]
    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the transfer options.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }
}

/// How a run ends once the payload is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Finish {
    /// Send REBOOT.
    #[default]
    Reboot,
    /// Send EXECUTE at this address (for images loaded into RAM).
    Execute(u64),
}

/// One provisioning job.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Where the payload goes.
    pub destination: Destination,
    /// Payload bytes.
    pub image: Vec<u8>,
    /// Mark the written partition bootable.
    pub set_boot: bool,
    /// Final step.
    pub finish: Finish,
}

impl Plan {
    /// Write `image` to `destination`, then reboot.
    pub fn new(destination: Destination, image: Vec<u8>) -> Self {
        Self {
            destination,
            image,
            set_boot: false,
            finish: Finish::Reboot,
        }
    }

    /// Plan for a file on disk.
    pub fn from_file(destination: Destination, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(destination, fs::read(path)?))
    }

    /// Mark the partition bootable after writing it.
    #[must_use]
    pub fn with_set_boot(mut self, set_boot: bool) -> Self {
        self.set_boot = set_boot;
        self
    }

    /// Choose the final step.
    #[must_use]
    pub fn with_finish(mut self, finish: Finish) -> Self {
        self.finish = finish;
        self
    }

    /// Check the plan against what the session can do, before any I/O.
    pub fn validate(&self, config: &SessionConfig) -> Result<()> {
        if u32::try_from(self.image.len()).is_err() {
            return Err(Error::InvalidArgument(format!(
                "image of {} bytes does not fit a 32-bit length",
                self.image.len()
            )));
        }
        if self.set_boot && !matches!(self.destination, Destination::Partition { .. }) {
            return Err(Error::InvalidArgument(format!(
                "cannot mark {} bootable; only partitions can be",
                self.destination
            )));
        }
        if matches!(self.finish, Finish::Execute(_))
            && !matches!(self.destination, Destination::Ram { .. })
        {
            return Err(Error::InvalidArgument(
                "EXECUTE as final step requires a RAM destination".into(),
            ));
        }
        if self.destination.needs_agent() && config.agent.is_none() {
            return Err(Error::Config(format!(
                "writing to {} requires a loader agent",
                self.destination
            )));
        }
        // Rejects bad partition names and empty paths up front.
        self.destination.begin_payload(0)?;
        Ok(())
    }
}

/// Drive the control lines through the reset-to-download pattern.
///
/// DTR and RTS are inverted at the device: DTR low asserts BOOT, RTS high
/// holds RESET. The device leaves reset with BOOT asserted, which selects
/// the ROM listener.
pub fn reset_to_download<P: Port + ?Sized>(port: &mut P, timing: &ResetTiming) -> Result<()> {
    debug!("Resetting {} into download mode", port.name());

    port.set_dtr(false)?;
    port.set_rts(true)?;
    trace!("DTR=0 RTS=1: reset held");
    thread::sleep(timing.hold);

    port.set_dtr(true)?;
    port.set_rts(false)?;
    trace!("DTR=1 RTS=0: boot select, reset released");
    thread::sleep(timing.pulse);

    port.set_dtr(false)?;
    trace!("DTR=0: boot select released");
    thread::sleep(timing.settle);

    Ok(())
}

/// One provisioning run over an exclusively owned port.
pub struct Session<P: Port> {
    port: P,
    config: SessionConfig,
    state: SessionState,
}

impl<P: Port> Session<P> {
    /// Wrap an open port. Nothing is sent yet.
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            state: SessionState::Idle,
        }
    }

    /// Try each candidate in turn and keep the first that answers a
    /// reset and handshake.
    ///
    /// Non-answering candidates are closed. The returned session is
    /// already synchronized at the initial baud rate.
    pub fn probe<T, O>(candidates: &[T], open: O, config: SessionConfig) -> Result<Self>
    where
        T: fmt::Display,
        O: FnMut(&T) -> Result<P>,
    {
        let (winner, port) = probe_candidates(candidates, open, |port| {
            reset_to_download(port, &config.reset)?;
            Synchronizer::with_config(port, config.sync.clone()).try_sync()
        })?;
        debug!("Using {winner}");

        Ok(Self {
            port,
            config,
            state: SessionState::SyncedLowBaud,
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run `f` as the step entering `next`.
    ///
    /// The move must be allowed by [`SessionState::can_advance_to`];
    /// otherwise nothing is sent and the state is left as it was. On success
    /// the session moves to `next`; on failure it becomes
    /// [`SessionState::Failed`] and the error names `next`.
    fn step<T>(&mut self, next: SessionState, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.state.can_advance_to(next) {
            return Err(self.refuse(next));
        }
        self.attempt(next, f)
    }

    /// Run a query that leaves the state unchanged.
    fn query<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let state = self.state;
        if state.is_terminal() || !state.is_synced() {
            return Err(self.refuse(state));
        }
        self.attempt(state, f)
    }

    fn refuse(&self, next: SessionState) -> Error {
        let reason = match self.state {
            SessionState::Failed => "session already failed; start a new run".to_string(),
            state if state.is_terminal() => format!("session already ended ({state:?})"),
            state => format!("cannot go from {state:?} to {next:?}"),
        };
        debug!("Refusing step: {reason}");
        Error::StepFailed {
            state: next,
            source: Box::new(Error::InvalidArgument(reason)),
        }
    }

    fn attempt<T>(&mut self, next: SessionState, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => {
                if next != self.state {
                    debug!("Session: {:?} -> {next:?}", self.state);
                }
                self.state = next;
                Ok(value)
            },
            Err(e) => {
                warn!("Step failed while {next}: {e}");
                self.state = SessionState::Failed;
                Err(Error::StepFailed {
                    state: next,
                    source: Box::new(e),
                })
            },
        }
    }

    fn handshake(&mut self) -> Result<()> {
        Synchronizer::with_config(&mut self.port, self.config.sync.clone()).sync()
    }

    fn switch_host_baud(&mut self, baud: u32) -> Result<()> {
        thread::sleep(self.config.baud_settle);
        self.port.set_baud_rate(baud)?;
        thread::sleep(self.config.baud_settle);
        self.port.clear_buffers()?;
        debug!("Host baud rate now {baud}");
        Ok(())
    }

    /// Reset the device into its ROM listener.
    pub fn reset_to_download(&mut self) -> Result<()> {
        self.step(SessionState::Reset, |s| {
            let initial = s.config.initial_baud;
            if s.port.baud_rate() != initial {
                s.port.set_baud_rate(initial)?;
            }
            reset_to_download(&mut s.port, &s.config.reset)
        })
    }

    /// Handshake at the initial baud rate.
    pub fn sync(&mut self) -> Result<()> {
        self.step(SessionState::SyncedLowBaud, Self::handshake)
    }

    /// Reset and handshake.
    pub fn connect_device(&mut self) -> Result<()> {
        self.reset_to_download()?;
        self.sync()?;
        info!("Connected to bootloader on {}", self.port.name());
        Ok(())
    }

    /// Switch the link to the configured high baud rate and handshake again.
    ///
    /// CHANGE_BAUDRATE is not awaited: the device answers at the old rate
    /// while the host is already switching, so the following SYNC at the
    /// new rate is the confirmation.
    pub fn raise_baud(&mut self) -> Result<()> {
        let high = self.config.high_baud;
        if high == self.port.baud_rate() {
            return self.step(SessionState::SyncedHighBaud, |_| {
                debug!("Already at {high} baud");
                Ok(())
            });
        }

        self.step(SessionState::BaudRaised, |s| {
            info!("Changing baud rate to {high}");
            thread::sleep(s.config.baud_settle);
            s.port.clear_buffers()?;
            let request = frame::encode(Opcode::ChangeBaudrate.tag(), &high.to_be_bytes())?;
            s.port.write_all_bytes(&request)?;
            s.switch_host_baud(high)
        })?;
        self.step(SessionState::SyncedHighBaud, Self::handshake)
    }

    /// Load the configured agent into RAM, start it and handshake with it.
    pub fn stage_agent(&mut self) -> Result<()> {
        self.step(SessionState::AgentStaged, |s| {
            let agent = s
                .config
                .agent
                .clone()
                .ok_or_else(|| Error::Config("no loader agent configured".into()))?;

            info!(
                "Staging {}-byte agent at {:#010x}",
                agent.image.len(),
                agent.load_address
            );
            let destination = Destination::Ram {
                address: agent.load_address,
            };
            protocol::transfer::transfer(
                &mut s.port,
                &destination,
                &agent.image,
                &s.config.transfer,
                |_, _| {},
            )?;

            exchange(&mut s.port, Opcode::Execute, &agent.load_address.to_be_bytes())?;
            thread::sleep(s.config.execute_settle);

            if let Some(baud) = agent.baud.filter(|b| *b != s.port.baud_rate()) {
                s.switch_host_baud(baud)?;
            }
            s.handshake()?;
            info!("Agent running");
            Ok(())
        })
    }

    /// Write `data` to `destination`.
    pub fn transfer<F>(
        &mut self,
        destination: &Destination,
        data: &[u8],
        progress: F,
    ) -> Result<TransferSummary>
    where
        F: FnMut(usize, usize),
    {
        self.step(SessionState::TransferInProgress, |s| {
            protocol::transfer::transfer(&mut s.port, destination, data, &s.config.transfer, progress)
        })
    }

    /// Post-transfer steps: optionally mark a partition bootable.
    pub fn finalize(&mut self, boot_partition: Option<&str>) -> Result<()> {
        self.step(SessionState::Finalized, |s| match boot_partition {
            Some(name) => protocol::transfer::set_boot(&mut s.port, name),
            None => Ok(()),
        })
    }

    /// Reboot the device.
    pub fn reboot(&mut self) -> Result<()> {
        self.step(SessionState::Rebooted, |s| {
            exchange(&mut s.port, Opcode::Reboot, &[])?;
            info!("Device rebooting");
            Ok(())
        })
    }

    /// Start execution at `address`.
    pub fn execute(&mut self, address: u64) -> Result<()> {
        self.step(SessionState::Running, |s| {
            exchange(&mut s.port, Opcode::Execute, &address.to_be_bytes())?;
            info!("Execution started at {address:#010x}");
            Ok(())
        })
    }

    /// Query the ROM version string.
    pub fn read_version(&mut self) -> Result<String> {
        self.query(|s| {
            let response = exchange(&mut s.port, Opcode::Version, &[])?;
            let version = String::from_utf8_lossy(&response.payload)
                .trim_end_matches('\0')
                .to_string();
            info!("ROM version: {version}");
            Ok(version)
        })
    }

    /// Query raw device information.
    pub fn read_info(&mut self) -> Result<Vec<u8>> {
        self.query(|s| {
            let response = exchange(&mut s.port, Opcode::Info, &[])?;
            debug!("Device info: {:02X?}", response.payload);
            Ok(response.payload)
        })
    }

    /// Run a whole plan and close the port.
    ///
    /// Steps already done (e.g. by [`Session::probe`]) are skipped.
    pub fn run<F>(mut self, plan: &Plan, progress: F) -> Result<TransferSummary>
    where
        F: FnMut(usize, usize),
    {
        let outcome = self.run_steps(plan, progress);
        match (&outcome, self.close()) {
            (Ok(_), Err(e)) => return Err(e),
            (Err(_), Err(e)) => debug!("Closing port after failure: {e}"),
            _ => {},
        }
        outcome
    }

    fn run_steps<F>(&mut self, plan: &Plan, progress: F) -> Result<TransferSummary>
    where
        F: FnMut(usize, usize),
    {
        plan.validate(&self.config)?;

        if !self.state.is_synced() {
            self.connect_device()?;
        }
        self.raise_baud()?;
        if plan.destination.needs_agent() {
            self.stage_agent()?;
        }

        let summary = self.transfer(&plan.destination, &plan.image, progress)?;

        let boot = match (&plan.destination, plan.set_boot) {
            (Destination::Partition { name }, true) => Some(name.as_str()),
            _ => None,
        };
        self.finalize(boot)?;

        match plan.finish {
            Finish::Reboot => self.reboot()?,
            Finish::Execute(address) => self.execute(address)?,
        }
        Ok(summary)
    }

    /// Close the port now.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}

impl<P: Port> Drop for Session<P> {
    fn drop(&mut self) {
        if let Err(e) = self.port.close() {
            debug!("Closing {} failed: {e}", self.port.name());
        }
    }
}

impl<P: Port> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("port", &self.port.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// How to find the device on the host.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Use this port, skip discovery.
    Port(String),
    /// Search by a board's serial bridge.
    Board(crate::target::board::Board),
    /// Search by an explicit descriptor.
    Descriptor(crate::device::DeviceDescriptor),
}

#[cfg(feature = "native")]
mod native_impl {
    use {
        super::*,
        crate::{
            device::{self, DetectedPort, EnumerationOrder, TieBreak},
            port::{NativePort, SerialConfig},
        },
    };

    impl Session<NativePort> {
        /// Open the device described by `target`.
        ///
        /// A single matching port is opened and returned unsynchronized.
        /// Several matching ports are probed in enumeration order.
        pub fn connect(target: &ConnectTarget, config: SessionConfig) -> Result<Self> {
            Self::connect_with(target, config, &EnumerationOrder)
        }

        /// [`Session::connect`] with an explicit tie-break policy.
        pub fn connect_with(
            target: &ConnectTarget,
            config: SessionConfig,
            tie_break: &dyn TieBreak,
        ) -> Result<Self> {
            let descriptor = match target {
                ConnectTarget::Port(name) => {
                    let port = NativePort::open(&SerialConfig::new(name, config.initial_baud))?;
                    return Ok(Self::new(port, config));
                },
                ConnectTarget::Board(board) => board.descriptor(),
                ConnectTarget::Descriptor(descriptor) => descriptor.clone(),
            };

            let candidates: Vec<DetectedPort> =
                device::locate(&descriptor, device::detect_ports(), tie_break)?;

            let baud = config.initial_baud;
            let open = move |candidate: &DetectedPort| {
                NativePort::open(&SerialConfig::new(&candidate.name, baud))
            };

            if let [only] = candidates.as_slice() {
                return Ok(Self::new(open(only)?, config));
            }
            Self::probe(&candidates, open, config)
        }
    }
}
