//! Machine records and lifecycle state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum machine name length.
pub const MAX_NAME_LEN: usize = 64;
/// Largest guest memory accepted, in MiB (16 TiB).
pub const MAX_MEMORY_MIB: u64 = 16 * 1024 * 1024;
/// Largest disk accepted, in GiB (64 TiB).
pub const MAX_DISK_GB: u64 = 64 * 1024;

/// Machine lifecycle state.
///
/// ```text
/// Uninitialized -[init]-> Stopped -[start]-> Starting -[ready]-> Running
/// Running -[stop]-> Stopping -[stopped]-> Stopped
/// any -[failure]-> Broken -[remove]-> (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// No record exists yet.
    #[default]
    Uninitialized,
    /// Provisioned, not running.
    Stopped,
    /// Hypervisor spawned, waiting for readiness.
    Starting,
    /// Ready; the tunnel endpoint answers.
    Running,
    /// Shutdown requested, waiting for exit.
    Stopping,
    /// Unrecoverable failure; only removal gets out of here.
    Broken,
}

impl MachineState {
    /// Check if the machine can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, MachineState::Stopped)
    }

    /// Check if the machine can be stopped.
    ///
    /// Starting and Stopping qualify too, so a boot or shutdown abandoned
    /// by an interrupted invocation can still be ended.
    pub fn can_stop(&self) -> bool {
        self.owns_process()
    }

    /// Check if resources may be changed.
    pub fn can_modify(&self) -> bool {
        matches!(self, MachineState::Stopped)
    }

    /// Whether the state implies an owned hypervisor process.
    pub fn owns_process(&self) -> bool {
        matches!(
            self,
            MachineState::Starting | MachineState::Running | MachineState::Stopping
        )
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Uninitialized => "uninitialized",
            MachineState::Stopped => "stopped",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
            MachineState::Stopping => "stopping",
            MachineState::Broken => "broken",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Machine resources. Fixed at creation, changeable only while stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of vCPUs.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Disk size in GiB.
    pub disk_size_gb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mib: 2048,
            disk_size_gb: 20,
        }
    }
}

impl Resources {
    /// Reject values no hypervisor will accept.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::InvalidArgument("cpus must be at least 1".into()));
        }
        if self.memory_mib < 128 {
            return Err(Error::InvalidArgument(
                "memory must be at least 128 MiB".into(),
            ));
        }
        if self.memory_mib > MAX_MEMORY_MIB {
            return Err(Error::InvalidArgument(format!(
                "memory must be at most {} MiB",
                MAX_MEMORY_MIB
            )));
        }
        if self.disk_size_gb == 0 {
            return Err(Error::InvalidArgument(
                "disk size must be at least 1 GiB".into(),
            ));
        }
        if self.disk_size_gb > MAX_DISK_GB {
            return Err(Error::InvalidArgument(format!(
                "disk size must be at most {} GiB",
                MAX_DISK_GB
            )));
        }
        Ok(())
    }
}

/// Partial resource change for a stopped machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// New vCPU count.
    pub cpus: Option<u32>,
    /// New memory in MiB.
    pub memory_mib: Option<u64>,
    /// New disk size in GiB (grow only).
    pub disk_size_gb: Option<u64>,
}

impl ResourceUpdate {
    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory_mib.is_none() && self.disk_size_gb.is_none()
    }

    /// Apply on top of `current`.
    pub fn apply(&self, current: Resources) -> Resources {
        Resources {
            cpus: self.cpus.unwrap_or(current.cpus),
            memory_mib: self.memory_mib.unwrap_or(current.memory_mib),
            disk_size_gb: self.disk_size_gb.unwrap_or(current.disk_size_gb),
        }
    }
}

/// Tunnel coordinates for reaching the machine's runtime socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCoordinates {
    /// Private key dedicated to this machine.
    pub identity_path: PathBuf,
    /// Host port forwarded to the guest's sshd.
    pub port: u16,
    /// Login user.
    pub user: String,
}

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    /// Machine name.
    pub name: String,
    /// Resources.
    pub resources: Resources,
    /// Optional base disk image to copy.
    pub image_path: Option<PathBuf>,
}

impl MachineSpec {
    /// Request with default resources and a blank disk.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Resources::default(),
            image_path: None,
        }
    }

    /// Set resources.
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Set the base image.
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

/// Persisted record of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine name (primary key).
    pub name: String,

    /// Lifecycle state.
    pub state: MachineState,

    /// Resources.
    pub resources: Resources,

    /// Tunnel coordinates.
    pub ssh: SshCoordinates,

    /// Disk image path.
    pub disk_path: PathBuf,

    /// Hypervisor pid while Starting/Running/Stopping.
    #[serde(default)]
    pub pid: Option<i32>,

    /// Creation timestamp (seconds since epoch).
    pub created_at: String,

    /// Last time the machine reached Running.
    #[serde(default)]
    pub last_up: Option<String>,
}

impl Machine {
    /// A freshly provisioned, stopped machine.
    pub fn new(
        name: impl Into<String>,
        resources: Resources,
        ssh: SshCoordinates,
        disk_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            state: MachineState::Stopped,
            resources,
            ssh,
            disk_path: disk_path.into(),
            pid: None,
            created_at: timestamp_now(),
            last_up: None,
        }
    }

    /// Tunnel URI for the runtime socket at `remote_socket`.
    pub fn tunnel_uri(&self, remote_socket: &str) -> String {
        crate::connection::ssh_uri(&self.ssh.user, "localhost", self.ssh.port, remote_socket)
    }

    /// Identity path as a string, for the registry.
    pub fn identity(&self) -> String {
        self.ssh.identity_path.to_string_lossy().to_string()
    }

    /// Enter Starting with the spawned process.
    pub fn mark_starting(&mut self, pid: i32) {
        self.state = MachineState::Starting;
        self.pid = Some(pid);
    }

    /// Enter Running.
    pub fn mark_running(&mut self) {
        self.state = MachineState::Running;
        self.last_up = Some(timestamp_now());
    }

    /// Enter Stopped, releasing the process handle.
    pub fn mark_stopped(&mut self) {
        self.state = MachineState::Stopped;
        self.pid = None;
    }

    /// Enter Broken, releasing the process handle.
    pub fn mark_broken(&mut self) {
        self.state = MachineState::Broken;
        self.pid = None;
    }

    /// Build the error for an operation attempted from the wrong state.
    pub fn invalid_state(&self, operation: &'static str, expected: &str) -> Error {
        Error::InvalidState {
            name: self.name.clone(),
            operation,
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }
}

/// Validate a machine name.
///
/// Names become directory names and connection names, so they are limited
/// to `[A-Za-z0-9][A-Za-z0-9_.-]*`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid_first || !valid_rest {
        return Err(Error::InvalidArgument(format!(
            "invalid machine name '{}': must match [A-Za-z0-9][A-Za-z0-9_.-]*",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "machine name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Current time as seconds since the epoch.
pub(crate) fn timestamp_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}
