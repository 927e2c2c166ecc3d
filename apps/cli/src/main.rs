//! slotd - memory card and USB mode daemon.
//!
//! Besides the daemon itself, the binary offers a couple of diagnostic
//! commands that work without root.

mod daemon;
mod gateway;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use slotd_core::Config;
use slotd_core::disk::SysfsRegistry;
use slotd_core::executor::PrivilegeEscalation;
use slotd_core::fat::validate_label;
use slotd_core::RequestError;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "slotd=info,slotd_core=info";

#[derive(Parser)]
#[command(name = "slotd")]
#[command(about = "Memory card and USB mode daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Escalation {
    None,
    Sudo,
    Pkexec,
}

impl From<Escalation> for PrivilegeEscalation {
    fn from(e: Escalation) -> Self {
        match e {
            Escalation::None => PrivilegeEscalation::None,
            Escalation::Sudo => PrivilegeEscalation::Sudo,
            Escalation::Pkexec => PrivilegeEscalation::Pkexec,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon, accepting signed requests on stdin.
    ///
    /// Notifications and responses are written to stdout as JSON lines;
    /// logs go to stderr.
    Daemon {
        /// Config file; the standard locations are searched otherwise.
        #[arg(long)]
        config: Option<PathBuf>,
        /// How helper programs get root.
        #[arg(long, value_enum, default_value = "none")]
        escalation: Escalation,
    },
    /// Print the device snapshot the daemon would see, as JSON.
    Scan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check whether LABEL is a valid FAT volume label.
    CheckLabel { label: String },
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn scan(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::locate(config.as_deref())?;
    let registry = SysfsRegistry::scan(&config)?;
    println!("{}", serde_json::to_string_pretty(registry.snapshot())?);
    Ok(())
}

fn check_label(label: &str) -> ExitCode {
    match validate_label(label) {
        Ok(()) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}", RequestError::from(e).code());
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config, escalation } => {
            if let Err(e) = daemon::run_daemon(config.as_deref(), escalation.into()) {
                error!("daemon error: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Scan { config } => match scan(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("scan failed: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::CheckLabel { label } => check_label(&label),
    }
}
