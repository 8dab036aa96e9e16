//! Connection registry.
//!
//! Durable mapping of connection name to service destination. This is the
//! single source of truth for which runtime a command talks to.
//!
//! # Persisted form
//!
//! ```toml
//! [engine]
//! active_service = "vm1"
//!
//! [engine.service_destinations.vm1]
//! uri = "ssh://core@localhost:41823/run/user/1000/podman/podman.sock"
//! identity = "/home/me/.local/share/vmctl/machines/vm1/id_ed25519"
//! ```
//!
//! The default destination is a single key, so two defaults cannot be
//! represented. Every mutation runs under an exclusive lock and replaces
//! the file atomically; readers never take the lock.

use crate::error::{Error, ResourceKind, Result};
use crate::lock::FileLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// URI schemes a destination may use.
pub const SUPPORTED_SCHEMES: &[&str] = &["ssh", "unix", "tcp"];

/// A named remote endpoint, as reported by [`ConnectionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDestination {
    /// Connection name.
    pub name: String,
    /// Connection URI.
    pub uri: String,
    /// Path to the credential used for the tunnel (empty if none).
    pub identity: String,
    /// Whether this is the default connection.
    pub default: bool,
}

/// Persisted destination body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Destination {
    uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    identity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EngineSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_service: Option<String>,
    #[serde(default)]
    service_destinations: BTreeMap<String, Destination>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    engine: EngineSection,
}

impl RegistryFile {
    fn destination(&self, name: &str) -> Option<ServiceDestination> {
        self.engine
            .service_destinations
            .get(name)
            .map(|d| self.to_row(name, d))
    }

    fn to_row(&self, name: &str, d: &Destination) -> ServiceDestination {
        ServiceDestination {
            name: name.to_string(),
            uri: d.uri.clone(),
            identity: d.identity.clone(),
            default: self.engine.active_service.as_deref() == Some(name),
        }
    }
}

/// The connection registry.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl ConnectionRegistry {
    /// Open the registry stored at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            lock_timeout,
        }
    }

    /// Path of the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All destinations, sorted by name.
    pub fn list(&self) -> Result<Vec<ServiceDestination>> {
        let file = self.read()?;
        Ok(file
            .engine
            .service_destinations
            .iter()
            .map(|(name, d)| file.to_row(name, d))
            .collect())
    }

    /// Look up one destination.
    pub fn get(&self, name: &str) -> Result<ServiceDestination> {
        self.read()?
            .destination(name)
            .ok_or_else(|| Error::connection_not_found(name))
    }

    /// The default destination, if one is set.
    pub fn default_destination(&self) -> Result<Option<ServiceDestination>> {
        let file = self.read()?;
        Ok(file
            .engine
            .active_service
            .as_deref()
            .and_then(|name| file.destination(name)))
    }

    /// Whether the registry holds no destinations.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.engine.service_destinations.is_empty())
    }

    /// Add a destination.
    ///
    /// The first destination added to an empty registry becomes the
    /// default regardless of `make_default`.
    pub fn add(&self, name: &str, identity: &str, uri: &str, make_default: bool) -> Result<()> {
        validate_name(name)?;
        validate_uri(uri)?;

        self.mutate(|file| {
            let destinations = &mut file.engine.service_destinations;
            if destinations.contains_key(name) {
                return Err(Error::DuplicateName {
                    kind: ResourceKind::Connection,
                    name: name.to_string(),
                });
            }

            let bootstrap = destinations.is_empty();
            destinations.insert(
                name.to_string(),
                Destination {
                    uri: uri.to_string(),
                    identity: identity.to_string(),
                },
            );
            if make_default || bootstrap {
                file.engine.active_service = Some(name.to_string());
            }
            Ok(())
        })?;

        tracing::info!(connection = %name, uri = %uri, "connection added");
        Ok(())
    }

    /// Replace the identity and URI of an existing destination.
    pub fn update(&self, name: &str, identity: &str, uri: &str) -> Result<()> {
        validate_uri(uri)?;

        self.mutate(|file| {
            let entry = file
                .engine
                .service_destinations
                .get_mut(name)
                .ok_or_else(|| Error::connection_not_found(name))?;
            entry.uri = uri.to_string();
            entry.identity = identity.to_string();
            Ok(())
        })?;

        tracing::debug!(connection = %name, uri = %uri, "connection updated");
        Ok(())
    }

    /// Remove a destination.
    ///
    /// Removing the default leaves the registry with no default.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.mutate(|file| {
            if file.engine.service_destinations.remove(name).is_none() {
                return Err(Error::connection_not_found(name));
            }
            if file.engine.active_service.as_deref() == Some(name) {
                file.engine.active_service = None;
            }
            Ok(())
        })?;

        tracing::info!(connection = %name, "connection removed");
        Ok(())
    }

    /// Make `name` the default destination.
    pub fn set_default(&self, name: &str) -> Result<()> {
        self.mutate(|file| {
            if !file.engine.service_destinations.contains_key(name) {
                return Err(Error::connection_not_found(name));
            }
            file.engine.active_service = Some(name.to_string());
            Ok(())
        })?;

        tracing::info!(connection = %name, "default connection set");
        Ok(())
    }

    /// Rename a destination. The default follows the rename.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;

        self.mutate(|file| {
            let destinations = &mut file.engine.service_destinations;
            if destinations.contains_key(new) {
                return Err(Error::DuplicateName {
                    kind: ResourceKind::Connection,
                    name: new.to_string(),
                });
            }
            let entry = destinations
                .remove(old)
                .ok_or_else(|| Error::connection_not_found(old))?;
            destinations.insert(new.to_string(), entry);

            if file.engine.active_service.as_deref() == Some(old) {
                file.engine.active_service = Some(new.to_string());
            }
            Ok(())
        })
    }

    /// Snapshot read. A missing file is an empty registry.
    fn read(&self) -> Result<RegistryFile> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default())
            }
            Err(e) => return Err(e.into()),
        };

        let mut file: RegistryFile = toml::from_str(&contents).map_err(|e| {
            Error::Storage(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        // A dangling default (hand-edited file) reads as no default.
        if let Some(active) = &file.engine.active_service {
            if !file.engine.service_destinations.contains_key(active) {
                file.engine.active_service = None;
            }
        }
        Ok(file)
    }

    /// Read-modify-write under the registry lock.
    ///
    /// Nothing is written if `f` fails.
    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryFile) -> Result<()>,
    {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut file = self.read()?;
        f(&mut file)?;

        let contents = toml::to_string_pretty(&file).map_err(|e| {
            Error::Storage(format!("failed to encode {}: {}", self.path.display(), e))
        })?;
        crate::storage::write_atomic(&self.path, contents.as_bytes())
    }
}

/// Build an `ssh://` destination URI.
pub fn ssh_uri(user: &str, host: &str, port: u16, socket_path: &str) -> String {
    let user_part = if user.is_empty() {
        String::new()
    } else {
        format!("{}@", user)
    };
    let socket = if socket_path.starts_with('/') {
        socket_path.to_string()
    } else {
        format!("/{}", socket_path)
    };
    format!("ssh://{}{}:{}{}", user_part, host, port, socket)
}

/// Check that a URI parses and uses a supported scheme.
pub fn validate_uri(uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| Error::InvalidArgument(format!("invalid connection uri '{}': {}", uri, e)))?;

    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(Error::InvalidArgument(format!(
            "unsupported connection scheme '{}' (expected one of: {})",
            parsed.scheme(),
            SUPPORTED_SCHEMES.join(", ")
        )));
    }
    if parsed.scheme() == "ssh" && parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidArgument(format!(
            "ssh connection uri '{}' has no host",
            uri
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("connection name must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> ConnectionRegistry {
        ConnectionRegistry::new(
            dir.path().join("connections.toml"),
            Duration::from_millis(500),
        )
    }

    fn defaults(reg: &ConnectionRegistry) -> Vec<String> {
        reg.list()
            .unwrap()
            .into_iter()
            .filter(|d| d.default)
            .map(|d| d.name)
            .collect()
    }

    #[test]
    fn test_empty_registry_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        assert!(reg.list().unwrap().is_empty());
        assert!(reg.default_destination().unwrap().is_none());
        assert!(reg.is_empty().unwrap());
    }

    #[test]
    fn test_default_walkthrough() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.add("alpha", "", "ssh://h1/sock", false).unwrap();
        assert_eq!(defaults(&reg), vec!["alpha"]);

        reg.add("beta", "", "ssh://h2/sock", true).unwrap();
        assert_eq!(defaults(&reg), vec!["beta"]);

        reg.remove("beta").unwrap();
        assert!(defaults(&reg).is_empty());
        assert!(reg.default_destination().unwrap().is_none());

        let names: Vec<_> = reg.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha"]);
    }

    #[test]
    fn test_add_duplicate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.add("alpha", "", "ssh://h1/sock", false).unwrap();
        let err = reg.add("alpha", "", "ssh://h9/sock", true).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
        assert_eq!(reg.get("alpha").unwrap().uri, "ssh://h1/sock");
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        for name in ["zeta", "alpha", "mid"] {
            reg.add(name, "", "tcp://localhost:8080", false).unwrap();
        }
        let names: Vec<_> = reg.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_set_default_moves_the_single_default() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.add("a", "", "ssh://h1/sock", false).unwrap();
        reg.add("b", "", "ssh://h2/sock", false).unwrap();
        reg.add("c", "", "ssh://h3/sock", false).unwrap();

        for name in ["b", "c", "a", "c"] {
            reg.set_default(name).unwrap();
            assert_eq!(defaults(&reg), vec![name.to_string()]);
        }

        let err = reg.set_default("missing").unwrap_err();
        assert!(err.is_not_found(ResourceKind::Connection));
        assert_eq!(defaults(&reg), vec!["c"]);
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let err = reg.remove("ghost").unwrap_err();
        assert!(err.is_not_found(ResourceKind::Connection));
    }

    #[test]
    fn test_update_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.add("vm1", "/keys/a", "ssh://core@localhost:1111/sock", false)
            .unwrap();

        reg.update("vm1", "/keys/b", "ssh://core@localhost:2222/sock")
            .unwrap();
        let d = reg.get("vm1").unwrap();
        assert_eq!(d.identity, "/keys/b");
        assert_eq!(d.uri, "ssh://core@localhost:2222/sock");
        assert!(d.default);

        reg.rename("vm1", "vm2").unwrap();
        assert!(reg.get("vm1").unwrap_err().is_not_found(ResourceKind::Connection));
        assert!(reg.get("vm2").unwrap().default);

        let err = reg.update("vm1", "", "ssh://h/sock").unwrap_err();
        assert!(err.is_not_found(ResourceKind::Connection));
    }

    #[test]
    fn test_rename_onto_existing_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.add("a", "", "ssh://h1/sock", false).unwrap();
        reg.add("b", "", "ssh://h2/sock", false).unwrap();
        let err = reg.rename("a", "b").unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
    }

    #[test]
    fn test_invalid_uris_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        for uri in ["not a uri", "http://example.com/sock", "ssh:///sock"] {
            let err = reg.add("x", "", uri, false).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{}: {:?}", uri, err);
        }
        assert!(reg.list().unwrap().is_empty());

        reg.add("local", "", "unix:///run/podman/podman.sock", false)
            .unwrap();
    }

    #[test]
    fn test_failed_mutation_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.add("alpha", "", "ssh://h1/sock", false).unwrap();
        let before = std::fs::read_to_string(reg.path()).unwrap();

        let _ = reg.remove("missing");
        let _ = reg.add("alpha", "", "ssh://h2/sock", true);

        assert_eq!(std::fs::read_to_string(reg.path()).unwrap(), before);
    }

    #[test]
    fn test_mutation_under_held_lock_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ConnectionRegistry::new(
            dir.path().join("connections.toml"),
            Duration::from_millis(100),
        );
        let _held = FileLock::acquire(
            &dir.path().join("connections.toml.lock"),
            Duration::from_millis(100),
        )
        .unwrap();

        let err = reg.add("alpha", "", "ssh://h1/sock", false).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        // Reads do not need the lock
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn test_dangling_default_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        std::fs::write(
            reg.path(),
            r#"
[engine]
active_service = "gone"

[engine.service_destinations.here]
uri = "ssh://h/sock"
"#,
        )
        .unwrap();

        assert!(reg.default_destination().unwrap().is_none());
        assert!(defaults(&reg).is_empty());
    }

    #[test]
    fn test_concurrent_adds_keep_single_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.toml");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = ConnectionRegistry::new(path.clone(), Duration::from_secs(10));
                std::thread::spawn(move || {
                    reg.add(&format!("c{}", i), "", "ssh://h/sock", i % 2 == 0)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reg = ConnectionRegistry::new(path, Duration::from_secs(1));
        assert_eq!(reg.list().unwrap().len(), 8);
        assert_eq!(defaults(&reg).len(), 1);
    }

    #[test]
    fn test_ssh_uri_builder() {
        assert_eq!(
            ssh_uri("core", "localhost", 2222, "/run/podman/podman.sock"),
            "ssh://core@localhost:2222/run/podman/podman.sock"
        );
        assert_eq!(
            ssh_uri("", "host", 22, "sock"),
            "ssh://host:22/sock"
        );
        validate_uri(&ssh_uri("core", "localhost", 2222, "/sock")).unwrap();
    }
}
