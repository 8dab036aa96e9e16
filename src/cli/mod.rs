//! CLI command implementations.

pub mod complete;
pub mod connection;
pub mod machine;
pub mod output;
pub mod parsers;

use vmctl::config::{Paths, VmctlConfig};
use vmctl::connection::ConnectionRegistry;
use vmctl::MachineManager;

/// Resolved configuration shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: VmctlConfig,
    pub paths: Paths,
}

impl Context {
    /// Manager over this platform's backend.
    pub fn manager(&self) -> vmctl::Result<MachineManager> {
        MachineManager::from_config(&self.config, &self.paths)
    }

    /// The connection registry.
    pub fn registry(&self) -> ConnectionRegistry {
        ConnectionRegistry::new(self.paths.connections_file(), self.config.lock_timeout)
    }
}
