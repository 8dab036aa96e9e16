//! Global vmctl configuration.
//!
//! Two things live here:
//! - [`VmctlConfig`]: user-tunable defaults loaded from `vmctl.toml`.
//! - [`Paths`]: where persisted state (connection registry and machine
//!   store) is read from and written to.
//!
//! Nothing in the core reads the process environment. The CLI resolves
//! overrides once and passes the result into every constructor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "vmctl";

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "vmctl.toml";

/// Registry file name inside the state root.
pub const CONNECTIONS_FILENAME: &str = "connections.toml";

/// Machine store directory inside the state root.
pub const MACHINES_DIRNAME: &str = "machines";

/// Global vmctl configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmctlConfig {
    /// Configuration format version.
    pub version: u8,

    /// Default number of vCPUs for new machines.
    pub default_cpus: u32,

    /// Default memory in MiB for new machines.
    pub default_memory_mib: u64,

    /// Default disk size in GiB for new machines.
    pub default_disk_gb: u64,

    /// User the tunnel logs in as.
    pub ssh_user: String,

    /// Path of the runtime API socket inside the machine.
    pub remote_socket: String,

    /// Hypervisor binary (name on PATH or absolute path).
    pub hypervisor_binary: String,

    /// Extra arguments appended to the hypervisor command line.
    pub hypervisor_args: Vec<String>,

    /// `ssh` client binary.
    pub ssh_binary: String,

    /// `ssh-keygen` binary.
    pub ssh_keygen_binary: String,

    /// How long to wait for a booting machine to answer on its tunnel port.
    #[serde(with = "humantime_serde")]
    pub boot_timeout: Duration,

    /// Grace period between a shutdown request and a forced kill.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// How long to wait for the exclusive state lock.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for VmctlConfig {
    fn default() -> Self {
        Self {
            version: 1,
            default_cpus: 2,
            default_memory_mib: 2048,
            default_disk_gb: 20,
            ssh_user: "core".to_string(),
            remote_socket: "/run/user/1000/podman/podman.sock".to_string(),
            hypervisor_binary: default_hypervisor_binary().to_string(),
            hypervisor_args: Vec::new(),
            ssh_binary: "ssh".to_string(),
            ssh_keygen_binary: "ssh-keygen".to_string(),
            boot_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

/// Hypervisor binary matching the host architecture.
fn default_hypervisor_binary() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "qemu-system-aarch64"
    } else {
        "qemu-system-x86_64"
    }
}

impl VmctlConfig {
    /// Default path of the configuration file.
    ///
    /// On Linux: `~/.config/vmctl/vmctl.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the default configuration; missing keys fall
    /// back to their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        crate::storage::write_atomic(path, contents.as_bytes())
    }
}

/// Locations of persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Use `root` as the state root.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default state root.
    ///
    /// On macOS: `~/Library/Application Support/vmctl`
    /// On Linux: `~/.local/share/vmctl`
    pub fn default_root() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::Config("could not determine data directory".into()))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Resolve paths, preferring an explicit override.
    pub fn resolve(override_root: Option<PathBuf>) -> Result<Self> {
        match override_root {
            Some(root) => Ok(Self::from_root(root)),
            None => Ok(Self::from_root(Self::default_root()?)),
        }
    }

    /// The state root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Connection registry file.
    pub fn connections_file(&self) -> PathBuf {
        self.root.join(CONNECTIONS_FILENAME)
    }

    /// Machine store directory.
    pub fn machines_dir(&self) -> PathBuf {
        self.root.join(MACHINES_DIRNAME)
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
