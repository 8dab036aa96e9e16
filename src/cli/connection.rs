//! Connection registry commands.

use super::output::{self, OutputFormat};
use super::parsers::destination_to_uri;
use super::Context;
use clap::{Args, Subcommand};

/// Manage connections
#[derive(Subcommand, Debug)]
pub enum ConnectionCmd {
    /// List connections
    #[command(alias = "ls")]
    List(ListCmd),
    /// Register a connection
    Add(AddCmd),
    /// Remove a connection
    #[command(alias = "rm")]
    Remove(RemoveCmd),
    /// Set the default connection
    Default(DefaultCmd),
    /// Rename a connection
    Rename(RenameCmd),
}

impl ConnectionCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        match self {
            ConnectionCmd::List(cmd) => cmd.run(ctx),
            ConnectionCmd::Add(cmd) => cmd.run(ctx),
            ConnectionCmd::Remove(cmd) => cmd.run(ctx),
            ConnectionCmd::Default(cmd) => cmd.run(ctx),
            ConnectionCmd::Rename(cmd) => cmd.run(ctx),
        }
    }
}

/// List connections
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

impl ListCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let destinations = ctx.registry().list()?;

        if output::print_structured(&destinations, self.format)? {
            return Ok(());
        }
        if destinations.is_empty() {
            println!("No connections found");
            return Ok(());
        }

        for line in output::connection_table(&destinations) {
            println!("{}", line);
        }
        Ok(())
    }
}

/// Register a connection
#[derive(Args, Debug)]
pub struct AddCmd {
    /// Connection name.
    pub name: String,

    /// Destination: a full URI, or [user@]host for SSH.
    pub destination: String,

    /// SSH identity file.
    #[arg(long, default_value = "")]
    pub identity: String,

    /// SSH port when the destination is not a URI.
    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    /// Remote runtime socket when the destination is not a URI
    /// (default from config).
    #[arg(long)]
    pub socket_path: Option<String>,

    /// Make this the default connection.
    #[arg(short, long)]
    pub default: bool,
}

impl AddCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let socket = self
            .socket_path
            .as_deref()
            .unwrap_or(&ctx.config.remote_socket);
        let uri = destination_to_uri(&self.destination, self.port, socket);

        ctx.registry()
            .add(&self.name, &self.identity, &uri, self.default)?;
        println!("Added connection '{}' ({})", self.name, uri);
        Ok(())
    }
}

/// Remove a connection
#[derive(Args, Debug)]
pub struct RemoveCmd {
    /// Connection name.
    pub name: String,
}

impl RemoveCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let registry = ctx.registry();
        let was_default = registry.get(&self.name)?.default;
        registry.remove(&self.name)?;

        println!("Removed connection: {}", self.name);
        if was_default {
            println!("No default connection is set; choose one with: vmctl connection default <name>");
        }
        Ok(())
    }
}

/// Set the default connection
#[derive(Args, Debug)]
pub struct DefaultCmd {
    /// Connection name.
    pub name: String,
}

impl DefaultCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        ctx.registry().set_default(&self.name)?;
        println!("Default connection: {}", self.name);
        Ok(())
    }
}

/// Rename a connection
#[derive(Args, Debug)]
pub struct RenameCmd {
    /// Current name.
    pub old: String,
    /// New name.
    pub new: String,
}

impl RenameCmd {
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        ctx.registry().rename(&self.old, &self.new)?;
        println!("Renamed connection '{}' to '{}'", self.old, self.new);
        Ok(())
    }
}
