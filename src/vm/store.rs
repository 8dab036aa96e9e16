//! Machine metadata store.
//!
//! One directory per machine under the store root, holding its
//! `machine.json` record next to its artifacts:
//!
//! ```text
//! machines/
//! ├── .lock              # store-wide exclusive lock
//! └── vm1/
//!     ├── machine.json   # persisted Machine record
//!     ├── disk.raw
//!     ├── id_ed25519{,.pub}
//!     ├── qmp.sock
//!     └── console.log
//! ```
//!
//! Mutations hold the store lock for their read-modify-write only.
//! Reads take no lock; records are replaced atomically so a reader sees
//! either the old or the new record.

use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::machine::Machine;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Record file name inside a machine directory.
pub const RECORD_FILENAME: &str = "machine.json";

const LOCK_FILENAME: &str = ".lock";

/// Persisted machine records.
#[derive(Debug, Clone)]
pub struct MachineStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl MachineStore {
    /// Open the store rooted at `root`. The directory need not exist yet.
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            lock_timeout,
        }
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the store-wide exclusive lock.
    pub fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.root.join(LOCK_FILENAME), self.lock_timeout)
    }

    /// Directory holding a machine's record and artifacts.
    pub fn machine_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(RECORD_FILENAME)
    }

    /// Whether a record exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_file()
    }

    /// Load a record.
    pub fn load(&self, name: &str) -> Result<Machine> {
        let path = self.record_path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::machine_not_found(name))
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map_err(|e| Error::Storage(format!("corrupt record {}: {}", path.display(), e)))
    }

    /// Write a record. Callers mutating existing state hold the lock.
    pub fn save(&self, machine: &Machine) -> Result<()> {
        let json = serde_json::to_vec_pretty(machine)
            .map_err(|e| Error::Storage(format!("failed to encode machine: {}", e)))?;
        crate::storage::write_atomic(&self.record_path(&machine.name), &json)
    }

    /// Delete a record. A missing record is fine.
    pub fn delete(&self, name: &str) -> Result<()> {
        crate::storage::remove_file_if_exists(&self.record_path(name))
    }

    /// All records, sorted by name.
    ///
    /// Directories without a record are skipped; so are unreadable
    /// records, with a warning.
    pub fn list(&self) -> Result<Vec<Machine>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut machines = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.load(&name) {
                Ok(m) => machines.push(m),
                Err(Error::NotFound { .. }) => {}
                Err(e) => tracing::warn!(machine = %name, error = %e, "skipping unreadable record"),
            }
        }

        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    /// Read-modify-write one record under the store lock.
    ///
    /// Nothing is written if `f` fails.
    pub fn update<T, F>(&self, name: &str, f: F) -> Result<(Machine, T)>
    where
        F: FnOnce(&mut Machine) -> Result<T>,
    {
        let _lock = self.lock()?;
        let mut machine = self.load(name)?;
        let out = f(&mut machine)?;
        self.save(&machine)?;
        Ok((machine, out))
    }
}
