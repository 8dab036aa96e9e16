//! Machine management commands.

use super::output::{self, OutputFormat};
use super::parsers::{parse_duration, parse_memory};
use super::Context;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use vmctl::poll::CancelFlag;
use vmctl::{MachineSpec, ResourceUpdate, Resources};

/// Manage machines
#[derive(Subcommand, Debug)]
pub enum MachineCmd {
    /// Provision a new machine (stopped)
    Init(InitCmd),
    /// Boot a machine and register its connection
    Start(StartCmd),
    /// Shut down a running machine
    Stop(StopCmd),
    /// Remove a machine and its connection
    #[command(alias = "remove")]
    Rm(RmCmd),
    /// List machines
    #[command(alias = "ls")]
    List(ListCmd),
    /// Show one machine
    Inspect(InspectCmd),
    /// Run a command in a machine over SSH
    Ssh(SshCmd),
    /// Change resources of a stopped machine
    Set(SetCmd),
}

impl MachineCmd {
    pub fn run(self, ctx: &mut Context) -> vmctl::Result<()> {
        match self {
            MachineCmd::Init(cmd) => cmd.run(ctx),
            MachineCmd::Start(cmd) => cmd.run(ctx),
            MachineCmd::Stop(cmd) => cmd.run(ctx),
            MachineCmd::Rm(cmd) => cmd.run(ctx),
            MachineCmd::List(cmd) => cmd.run(ctx),
            MachineCmd::Inspect(cmd) => cmd.run(ctx),
            MachineCmd::Ssh(cmd) => cmd.run(ctx),
            MachineCmd::Set(cmd) => cmd.run(ctx),
        }
    }
}

/// Provision a new machine
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Machine name.
    pub name: String,

    /// Number of vCPUs (default from config).
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in MiB, or with a G suffix (default from config).
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Disk size in GiB (default from config).
    #[arg(long)]
    pub disk_size: Option<u64>,

    /// Base disk image to copy instead of a blank disk.
    #[arg(long, value_name = "PATH")]
    pub image: Option<PathBuf>,
}

impl InitCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let resources = Resources {
            cpus: self.cpus.unwrap_or(ctx.config.default_cpus),
            memory_mib: self.memory.unwrap_or(ctx.config.default_memory_mib),
            disk_size_gb: self.disk_size.unwrap_or(ctx.config.default_disk_gb),
        };
        let mut spec = MachineSpec::new(&self.name).resources(resources);
        if let Some(image) = self.image {
            spec = spec.image(image);
        }

        let machine = ctx.manager()?.create(&spec)?;
        println!("Machine '{}' initialized", machine.name);
        println!("Start it with: vmctl machine start {}", machine.name);
        Ok(())
    }
}

/// Boot a machine
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Machine name.
    pub name: String,

    /// Make this machine's connection the default.
    #[arg(long)]
    pub default: bool,

    /// How long to wait for the machine to boot (e.g., "90s", "5m").
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl StartCmd {
    pub fn run(self, ctx: &mut Context) -> vmctl::Result<()> {
        if let Some(timeout) = self.timeout {
            ctx.config.boot_timeout = timeout;
        }
        let manager = ctx.manager()?;

        let cancel = CancelFlag::new();
        let on_interrupt = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
            tracing::warn!(error = %e, "failed to install interrupt handler");
        }

        println!("Starting machine '{}'...", self.name);
        let machine = manager.start_machine(&self.name, self.default, Some(&cancel))?;
        println!(
            "Machine '{}' running (PID: {})",
            machine.name,
            machine.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        );

        if let Some(default) = manager.registry().default_destination()? {
            if default.name == machine.name {
                println!("Connection '{}' is the default", default.name);
            }
        }
        Ok(())
    }
}

/// Shut down a running machine
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Machine name.
    pub name: String,

    /// Grace period before the machine is killed (e.g., "30s").
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl StopCmd {
    pub fn run(self, ctx: &mut Context) -> vmctl::Result<()> {
        if let Some(timeout) = self.timeout {
            ctx.config.shutdown_timeout = timeout;
        }

        println!("Stopping machine '{}'...", self.name);
        ctx.manager()?.stop_machine(&self.name)?;
        println!("Machine '{}' stopped", self.name);
        Ok(())
    }
}

/// Remove a machine
#[derive(Args, Debug)]
pub struct RmCmd {
    /// Machine name.
    pub name: String,

    /// Stop the machine first if it is running.
    #[arg(short, long)]
    pub force: bool,
}

impl RmCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        ctx.manager()?.remove_machine(&self.name, self.force)?;
        println!("Removed machine: {}", self.name);
        Ok(())
    }
}

/// List machines
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Print names only.
    #[arg(short, long)]
    pub quiet: bool,
}

impl ListCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let machines = ctx.manager()?.list()?;

        if output::print_structured(&machines, self.format)? {
            return Ok(());
        }
        if self.quiet {
            for m in &machines {
                println!("{}", m.name);
            }
            return Ok(());
        }
        if machines.is_empty() {
            println!("No machines found");
            return Ok(());
        }
        output::print_machine_table(&machines);
        Ok(())
    }
}

/// Show one machine
#[derive(Args, Debug)]
pub struct InspectCmd {
    /// Machine name.
    pub name: String,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

impl InspectCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let machine = ctx.manager()?.inspect(&self.name)?;
        if !output::print_structured(&machine, self.format)? {
            output::print_machine_details(&machine);
        }
        Ok(())
    }
}

/// Run a command in a machine
#[derive(Args, Debug)]
pub struct SshCmd {
    /// Machine name.
    pub name: String,

    /// Command to run (interactive shell if omitted).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SshCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let result = ctx.manager()?.ssh(&self.name, &self.command)?;
        if !result.output.is_empty() {
            print!("{}", result.output);
        }
        if !result.success() {
            std::process::exit(result.status);
        }
        Ok(())
    }
}

/// Change resources of a stopped machine
#[derive(Args, Debug)]
pub struct SetCmd {
    /// Machine name.
    pub name: String,

    /// Number of vCPUs.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in MiB, or with a G suffix.
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Disk size in GiB (grow only).
    #[arg(long)]
    pub disk_size: Option<u64>,
}

impl SetCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let update = ResourceUpdate {
            cpus: self.cpus,
            memory_mib: self.memory,
            disk_size_gb: self.disk_size,
        };
        let machine = ctx.manager()?.set_resources(&self.name, &update)?;
        println!(
            "Machine '{}': {} CPUs, {} MiB, {} GiB",
            machine.name,
            machine.resources.cpus,
            machine.resources.memory_mib,
            machine.resources.disk_size_gb
        );
        Ok(())
    }
}
