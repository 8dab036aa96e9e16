//! vmctl CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmctl::config::{Paths, VmctlConfig};

mod cli;

/// vmctl - provision container-engine machines and manage connections
#[derive(Parser, Debug)]
#[command(name = "vmctl")]
#[command(about = "Provision container-engine machines and manage connections")]
#[command(version)]
struct Cli {
    /// Directory holding machines and the connection registry.
    #[arg(long, global = true, env = "VMCTL_STATE_DIR", value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Configuration file (default: <config dir>/vmctl/vmctl.toml).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage machines.
    #[command(subcommand)]
    Machine(cli::machine::MachineCmd),

    /// Manage connections.
    #[command(subcommand, alias = "system")]
    Connection(cli::connection::ConnectionCmd),

    /// Print completion candidates.
    #[command(name = "__complete", hide = true)]
    Complete(cli::complete::CompleteCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = vmctl::VERSION, "starting vmctl");

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            VmctlConfig::default()
        }
    };

    let paths = match Paths::resolve(cli.state_dir) {
        Ok(p) => p,
        Err(e) => exit_with(e),
    };
    tracing::debug!(root = %paths.root().display(), "state directory");

    let mut ctx = cli::Context { config, paths };

    let result = match cli.command {
        Commands::Machine(cmd) => cmd.run(&mut ctx),
        Commands::Connection(cmd) => cmd.run(&ctx),
        Commands::Complete(cmd) => cmd.run(&ctx),
    };

    if let Err(e) = result {
        exit_with(e);
    }
}

fn load_config(path: Option<&std::path::Path>) -> vmctl::Result<VmctlConfig> {
    match path {
        Some(path) => VmctlConfig::load_from(path),
        None => VmctlConfig::load(),
    }
}

fn exit_with(e: vmctl::Error) -> ! {
    tracing::debug!(error = ?e, "command failed");
    eprintln!("Error: {}", e);
    std::process::exit(e.exit_code());
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vmctl=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
