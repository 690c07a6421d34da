//! mmflash CLI - Command-line tool for provisioning MadMachine SwiftIO boards.
//!
//! ## Features
//!
//! - Download images to RAM, raw flash, named partitions or the board filesystem
//! - Stage a loader agent for partition and filesystem writes
//! - Query the ROM version and device information
//! - Board-aware serial port discovery
//! - Configuration files and environment variable support

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use mmflash::{
    AgentConfig, Board, ConnectTarget, Destination, DeviceDescriptor, EndLayout, Finish, Plan,
    Port, Session, SessionConfig, SessionState, TransferOptions,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors raised by the CLI itself rather than by the device.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The command line does not say enough to act on.
    #[error("{0}")]
    Usage(String),
    /// A configuration file or value is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

/// mmflash - Provision MadMachine SwiftIO boards over the serial bootloader.
///
/// Environment variables:
///   MMFLASH_PORT        - Serial port to use
///   MMFLASH_BOARD       - Board type (SwiftIOBoard, SwiftIOMicro, Generic)
///   MMFLASH_DEVICE      - Serial bridge description pattern
///   MMFLASH_BAUD        - ROM listener baud rate (default: 115200)
///   MMFLASH_HIGH_BAUD   - Transfer baud rate (default: 3000000)
#[derive(Parser)]
#[command(name = "mmflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/madmachineio/mmflash")]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "MMFLASH_PORT")]
    port: Option<String>,

    /// Board type, used to find its serial bridge.
    #[arg(long, global = true, env = "MMFLASH_BOARD", value_parser = parse_board)]
    board: Option<Board>,

    /// Serial bridge description pattern (e.g. "USB Single Serial").
    #[arg(long, global = true, env = "MMFLASH_DEVICE")]
    device: Option<String>,

    /// Baud rate of the ROM listener.
    #[arg(short, long, global = true, env = "MMFLASH_BAUD")]
    baud: Option<u32>,

    /// Baud rate used for the transfer.
    #[arg(long, global = true, env = "MMFLASH_HIGH_BAUD")]
    high_baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Download an image to the device.
    Download(DownloadArgs),

    /// Read the ROM version and device information.
    Version {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Image file to send.
    file: PathBuf,

    #[command(flatten)]
    destination: DestinationArgs,

    /// Mark the written partition bootable.
    #[arg(long, requires = "partition")]
    set_boot: bool,

    /// Start the image after loading it into RAM instead of rebooting.
    #[arg(long, requires = "ram")]
    execute: bool,

    /// Loader agent image (needed for --partition and --fs).
    #[arg(long, value_name = "PATH")]
    agent: Option<PathBuf>,

    /// RAM address the agent is loaded to and started at.
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_u64)]
    agent_address: Option<u64>,

    /// Baud rate the agent comes up at.
    #[arg(long, value_name = "BAUD")]
    agent_baud: Option<u32>,

    /// DATA chunk size in bytes (at most 65536).
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Resume address appended to RAM/flash END requests.
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_u64)]
    end_resume_address: Option<u64>,
}

/// Where the image goes; exactly one is required.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct DestinationArgs {
    /// Load into RAM at this address.
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_u64)]
    ram: Option<u64>,

    /// Write raw flash at this offset.
    #[arg(long, value_name = "OFFSET", value_parser = parse_hex_u64)]
    flash: Option<u64>,

    /// Write the named flash partition.
    #[arg(long, value_name = "NAME")]
    partition: Option<String>,

    /// Write this path on the device filesystem (defaults to the board's
    /// boot image when only --board is known).
    #[arg(long = "fs", value_name = "PATH")]
    fs_path: Option<Option<String>>,
}

impl DestinationArgs {
    fn destination(&self, board: Option<Board>) -> Result<Destination, CliError> {
        match (self.ram, self.flash, &self.partition, &self.fs_path) {
            (Some(address), None, None, None) => Ok(Destination::Ram { address }),
            (None, Some(offset), None, None) => Ok(Destination::Flash { offset }),
            (None, None, Some(name), None) => Ok(Destination::Partition { name: name.clone() }),
            (None, None, None, Some(Some(path))) => {
                Ok(Destination::Filesystem { path: path.clone() })
            },
            (None, None, None, Some(None)) => match board {
                Some(board) => Ok(Destination::Filesystem {
                    path: board.image_path(),
                }),
                None => Err(CliError::Usage(
                    "--fs without a path needs --board to pick the image name".into(),
                )),
            },
            _ => Err(CliError::Usage(
                "exactly one of --ram, --flash, --partition or --fs is required".into(),
            )),
        }
    }
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x2020_0000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u64::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn parse_board(s: &str) -> Result<Board, String> {
    s.parse::<Board>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "mmflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&e))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Download(args) => cmd_download(cli, &config, args),
        Commands::Version { json } => cmd_version(cli, &config, *json),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        },
    }
}

/// Map a failure to the process exit code: 2 for usage and configuration
/// problems (a descriptor that matches no port included), 1 for everything
/// else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<CliError>().is_some() {
        return 2;
    }
    match err.downcast_ref::<mmflash::Error>().map(mmflash::Error::root) {
        Some(
            mmflash::Error::Config(_)
            | mmflash::Error::InvalidArgument(_)
            | mmflash::Error::NoMatchingPort(_),
        ) => 2,
        _ => 1,
    }
}

/// Board named on the command line or in the configuration.
fn configured_board(cli: &Cli, config: &Config) -> Result<Option<Board>> {
    Ok(match (cli.board, &config.connection.board) {
        (Some(board), _) => Some(board),
        (None, Some(name)) => Some(name.parse::<Board>()?),
        (None, None) => None,
    })
}

/// Decide how to find the device: explicit port, then description pattern,
/// then board, then the single recognised board attached to the host.
fn connect_target(cli: &Cli, config: &Config) -> Result<ConnectTarget> {
    if let Some(port) = cli.port.clone().or_else(|| config.connection.port.clone()) {
        return Ok(ConnectTarget::Port(port));
    }
    if let Some(pattern) = cli
        .device
        .clone()
        .or_else(|| config.connection.device.clone())
    {
        return Ok(ConnectTarget::Descriptor(DeviceDescriptor::new(pattern)));
    }

    if let Some(board) = configured_board(cli, config)? {
        return Ok(ConnectTarget::Board(board));
    }

    let mut boards: Vec<Board> = mmflash::detect_ports()
        .into_iter()
        .filter_map(|port| port.board)
        .collect();
    boards.dedup();

    match boards.as_slice() {
        [board] => {
            info!("Detected {board}");
            Ok(ConnectTarget::Board(*board))
        },
        [] => Err(CliError::Usage(
            "no board detected; pass --port, --board or --device".into(),
        )
        .into()),
        _ => Err(CliError::Usage(
            "several boards detected; pass --port or --board to pick one".into(),
        )
        .into()),
    }
}

/// Session settings from the command line and configuration.
fn session_config(cli: &Cli, config: &Config) -> SessionConfig {
    let mut session = SessionConfig::default();
    if let Some(baud) = cli.baud.or(config.connection.baud) {
        session.initial_baud = baud;
    }
    if let Some(high_baud) = cli.high_baud.or(config.connection.high_baud) {
        session = session.with_high_baud(high_baud);
    }
    session
}

fn load_agent(args: &DownloadArgs, config: &Config) -> Result<Option<AgentConfig>> {
    let Some(path) = args.agent.as_ref().or(config.agent.path.as_ref()) else {
        return Ok(None);
    };
    let load_address = args
        .agent_address
        .or(config.agent.load_address)
        .ok_or_else(|| {
            CliError::Config("agent load address not set (--agent-address or [agent] load_address)".into())
        })?;

    let mut agent = AgentConfig::from_file(path, load_address)
        .with_context(|| format!("Failed to read agent {}", path.display()))?;
    if let Some(baud) = args.agent_baud.or(config.agent.baud) {
        agent = agent.with_baud(baud);
    }
    Ok(Some(agent))
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Download command implementation.
fn cmd_download(cli: &Cli, config: &Config, args: &DownloadArgs) -> Result<()> {
    let destination = args.destination.destination(configured_board(cli, config)?)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            args.file.display()
        );
    }
    let mut plan = Plan::from_file(destination, &args.file)
        .with_context(|| format!("Failed to read image {}", args.file.display()))?
        .with_set_boot(args.set_boot);
    if args.execute {
        if let Destination::Ram { address } = plan.destination {
            plan = plan.with_finish(Finish::Execute(address));
        }
    }

    let mut transfer = TransferOptions::default();
    if let Some(chunk_size) = args.chunk_size.or(config.protocol.chunk_size) {
        transfer = transfer.with_chunk_size(chunk_size);
    }
    if let Some(address) = args
        .end_resume_address
        .or(config.protocol.end_resume_address)
    {
        transfer = transfer.with_end_layout(EndLayout::WithResumeAddress(address));
    }

    let mut session_config = session_config(cli, config).with_transfer(transfer);
    if let Some(agent) = load_agent(args, config)? {
        session_config = session_config.with_agent(agent);
    }
    plan.validate(&session_config)?;

    let target = connect_target(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Waiting for device...", style("⏳").yellow());
    }
    let session = Session::connect(&target, session_config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {}",
            style("🔌").cyan(),
            style(session.port().name()).cyan()
        );
    }

    let pb = progress_bar(cli.quiet);
    pb.set_message(format!("Writing {}", plan.destination));
    let summary = session.run(&plan, |sent, total| {
        if total > 0 {
            pb.set_position((sent * 100 / total) as u64);
        }
    })?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Wrote {} bytes in {} chunks (CRC32 {:#010x})",
            style("🎉").green().bold(),
            summary.bytes,
            summary.chunks,
            summary.crc
        );
    }

    Ok(())
}

/// Version command implementation.
fn cmd_version(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let target = connect_target(cli, config)?;
    let mut session = Session::connect(&target, session_config(cli, config))?;
    if session.state() == SessionState::Idle {
        session.connect_device()?;
    }

    let version = session.read_version()?;
    let info = session.read_info()?;
    let hex: String = info.iter().map(|b| format!("{b:02X}")).collect();

    if json {
        let out = serde_json::json!({
            "port": session.port().name(),
            "version": version,
            "info": hex,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    eprintln!(
        "{} {}",
        style("Port:").bold(),
        style(session.port().name()).cyan()
    );
    eprintln!("{} {version}", style("ROM version:").bold());
    eprintln!("{} {hex}", style("Device info:").bold());
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let detected = mmflash::detect_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&detected).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for line in mmflash::format_port_list(&detected) {
        eprintln!("  {} {line}", style("•").green());
    }

    let boards: Vec<_> = detected.iter().filter(|p| p.board.is_some()).collect();
    if let [port] = boards.as_slice() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&port.name).cyan().bold()
        );
    }
}
