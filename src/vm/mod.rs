//! Machine backends.
//!
//! This module provides the core abstractions for provisioning and
//! supervising machines:
//! - [`MachineBackend`]: capability trait every virtualization backend implements
//! - [`MachineStore`]: persisted machine metadata shared by backends
//! - [`QemuBackend`]: process-based backend driving a QEMU hypervisor

pub mod qemu;
pub mod ssh;
pub mod store;

use crate::config::{Paths, VmctlConfig};
use crate::error::Result;
use crate::machine::{Machine, MachineSpec, ResourceUpdate};
use crate::poll::CancelFlag;

pub use qemu::QemuBackend;
pub use ssh::SshOutput;
pub use store::MachineStore;

/// A virtualization technology able to carry machines through their
/// lifecycle.
///
/// Implementations persist every state transition before returning, so a
/// later invocation (possibly in another process) sees the result.
pub trait MachineBackend: Send + Sync {
    /// Backend name (e.g., "qemu").
    fn name(&self) -> &'static str;

    /// Check if this backend is usable on the current host.
    fn is_available(&self) -> bool;

    /// Provision a machine: disk, dedicated SSH keypair, metadata.
    ///
    /// The new machine is Stopped. Nothing is left behind on failure.
    fn init(&self, spec: &MachineSpec) -> Result<Machine>;

    /// Boot a Stopped machine and wait until it is reachable.
    ///
    /// Ends Running on success and Broken on timeout. If `cancel` fires
    /// the machine is left Starting for a later inspect to reconcile.
    fn start(&self, name: &str, cancel: Option<&CancelFlag>) -> Result<Machine>;

    /// Shut down a machine that owns a live hypervisor, forcing it after
    /// the grace period.
    ///
    /// Besides Running, this accepts Starting and Stopping records left
    /// behind by an interrupted invocation. Always ends Stopped once the
    /// shutdown began.
    fn stop(&self, name: &str) -> Result<Machine>;

    /// Delete a machine that is not running. Missing artifacts are fine.
    fn remove(&self, name: &str) -> Result<()>;

    /// All known machines, sorted by name, with liveness reconciled.
    fn list(&self) -> Result<Vec<Machine>>;

    /// One machine, with liveness reconciled.
    fn inspect(&self, name: &str) -> Result<Machine>;

    /// Like [`inspect`](Self::inspect), but writes the reconciled state
    /// back under the store lock before returning it.
    fn reconcile(&self, name: &str) -> Result<Machine>;

    /// Run a command in a Running machine over its tunnel.
    fn ssh(&self, name: &str, command: &[String]) -> Result<SshOutput>;

    /// Change resources of a Stopped machine.
    fn set_resources(&self, name: &str, update: &ResourceUpdate) -> Result<Machine>;
}

/// Get the backend for this platform.
///
/// # Errors
///
/// Returns [`crate::Error::BackendUnavailable`] if this platform has no
/// backend.
pub fn default_backend(config: &VmctlConfig, paths: &Paths) -> Result<Box<dyn MachineBackend>> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        Ok(Box::new(QemuBackend::new(config, paths)))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (config, paths);
        Err(crate::Error::BackendUnavailable(
            "no machine backend for this platform".into(),
        ))
    }
}
