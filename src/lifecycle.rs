//! Machine lifecycle manager.
//!
//! Drives a [`MachineBackend`] and the [`ConnectionRegistry`] together so
//! that a machine reported as started always has a registry entry
//! pointing at its tunnel.

use crate::config::{Paths, VmctlConfig};
use crate::connection::ConnectionRegistry;
use crate::error::{Error, ResourceKind, Result};
use crate::machine::{Machine, MachineSpec, MachineState, ResourceUpdate};
use crate::poll::CancelFlag;
use crate::vm::{MachineBackend, SshOutput};

/// Orchestrates machine operations and their registry entries.
pub struct MachineManager {
    backend: Box<dyn MachineBackend>,
    registry: ConnectionRegistry,
    remote_socket: String,
}

impl MachineManager {
    /// Create a manager over an explicit backend and registry.
    pub fn new(
        backend: Box<dyn MachineBackend>,
        registry: ConnectionRegistry,
        remote_socket: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            registry,
            remote_socket: remote_socket.into(),
        }
    }

    /// Create a manager with this platform's backend, rooted at `paths`.
    pub fn from_config(config: &VmctlConfig, paths: &Paths) -> Result<Self> {
        let backend = crate::vm::default_backend(config, paths)?;
        let registry = ConnectionRegistry::new(paths.connections_file(), config.lock_timeout);
        Ok(Self::new(backend, registry, config.remote_socket.clone()))
    }

    /// The backend in use.
    pub fn backend(&self) -> &dyn MachineBackend {
        self.backend.as_ref()
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Provision a machine. No connection is registered until it runs.
    pub fn create(&self, spec: &MachineSpec) -> Result<Machine> {
        self.backend.init(spec)
    }

    /// Start a machine and register its tunnel.
    ///
    /// The machine's recorded state is reconciled first. Starting a
    /// machine that is already running only refreshes its registry entry. The first connection ever registered becomes the
    /// default; `make_default` promotes this one regardless.
    pub fn start_machine(
        &self,
        name: &str,
        make_default: bool,
        cancel: Option<&CancelFlag>,
    ) -> Result<Machine> {
        let current = self.backend.reconcile(name)?;
        let machine = if current.state == MachineState::Running {
            tracing::debug!(machine = %name, "already running, refreshing connection");
            current
        } else {
            tracing::debug!(machine = %name, backend = self.backend.name(), "starting machine");
            self.backend.start(name, cancel)?
        };

        if let Err(e) = self.register(&machine, make_default) {
            // A running machine without a usable entry is not allowed to
            // outlive this call.
            tracing::warn!(machine = %name, error = %e, "connection registration failed, stopping machine");
            if let Err(stop_err) = self.backend.stop(name) {
                tracing::warn!(machine = %name, error = %stop_err, "failed to stop machine");
            }
            return Err(e);
        }

        Ok(machine)
    }

    fn register(&self, machine: &Machine, make_default: bool) -> Result<()> {
        let uri = machine.tunnel_uri(&self.remote_socket);
        let identity = machine.identity();

        match self
            .registry
            .add(&machine.name, &identity, &uri, make_default)
        {
            Ok(()) => Ok(()),
            Err(Error::DuplicateName { .. }) => {
                self.registry.update(&machine.name, &identity, &uri)?;
                if make_default {
                    self.registry.set_default(&machine.name)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop a machine. Its connection stays registered.
    pub fn stop_machine(&self, name: &str) -> Result<Machine> {
        self.backend.stop(name)
    }

    /// Remove a machine and its connection.
    ///
    /// A machine that still owns a hypervisor process (Running, or an
    /// abandoned Starting/Stopping) is only removed with `force`, which
    /// stops it first.
    pub fn remove_machine(&self, name: &str, force: bool) -> Result<()> {
        let machine = self.backend.reconcile(name)?;
        if machine.state.owns_process() {
            if !force {
                return Err(machine.invalid_state("remove", "stopped (use force to stop it first)"));
            }
            self.backend.stop(name)?;
        }

        self.backend.remove(name)?;

        match self.registry.remove(name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found(ResourceKind::Connection) => {
                tracing::debug!(machine = %name, "machine had no connection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// All machines, sorted by name.
    pub fn list(&self) -> Result<Vec<Machine>> {
        self.backend.list()
    }

    /// One machine.
    pub fn inspect(&self, name: &str) -> Result<Machine> {
        self.backend.inspect(name)
    }

    /// Run a command in a running machine.
    pub fn ssh(&self, name: &str, command: &[String]) -> Result<SshOutput> {
        self.backend.ssh(name, command)
    }

    /// Change resources of a stopped machine.
    pub fn set_resources(&self, name: &str, update: &ResourceUpdate) -> Result<Machine> {
        if update.is_empty() {
            return Err(Error::InvalidArgument(
                "no resource changes requested".into(),
            ));
        }
        self.backend.set_resources(name, update)
    }
}
