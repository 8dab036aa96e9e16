//! Error types for vmctl.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using vmctl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of named object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A provisioned virtual machine.
    Machine,
    /// A service destination in the connection registry.
    Connection,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Machine => write!(f, "machine"),
            ResourceKind::Connection => write!(f, "connection"),
        }
    }
}

/// Errors that can occur in vmctl operations.
///
/// Every variant renders with a stable category prefix (`not found:`,
/// `invalid state:`, ...) so scripts can match on the failure kind.
#[derive(Error, Debug)]
pub enum Error {
    /// Name unknown to the registry or the backend.
    #[error("not found: {kind} '{name}'")]
    NotFound {
        /// What was looked up.
        kind: ResourceKind,
        /// The name that was looked up.
        name: String,
    },

    /// Create/add on a name that already exists.
    #[error("duplicate name: {kind} '{name}' already exists")]
    DuplicateName {
        /// What was being created.
        kind: ResourceKind,
        /// The conflicting name.
        name: String,
    },

    /// Operation not legal from the machine's current state.
    #[error("invalid state: cannot {operation} machine '{name}': expected {expected}, got {actual}")]
    InvalidState {
        /// Machine name.
        name: String,
        /// Attempted operation.
        operation: &'static str,
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Disk, image or key creation failed.
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),

    /// Readiness was not observed within the boot timeout.
    #[error("start timeout: machine '{name}' not ready after {}", humantime::format_duration(*timeout))]
    StartTimeout {
        /// Machine name.
        name: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The virtualization technology is missing or misconfigured.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The exclusive lock could not be taken in time.
    #[error("lock contention: {} is held by another process", path.display())]
    LockContention {
        /// Lock file path.
        path: PathBuf,
    },

    /// A caller-supplied value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking wait was cancelled by the caller.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The backend process misbehaved (e.g. exited while booting).
    #[error("backend failure: {0}")]
    Backend(String),

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// Failed to load or save configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted state could not be decoded or encoded.
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a machine not-found error.
    pub fn machine_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Machine,
            name: name.into(),
        }
    }

    /// Create a connection not-found error.
    pub fn connection_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Connection,
            name: name.into(),
        }
    }

    /// Create a resource allocation error with a message.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::ResourceAllocation(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Whether this is a not-found error for the given kind.
    pub fn is_not_found(&self, of: ResourceKind) -> bool {
        matches!(self, Error::NotFound { kind, .. } if *kind == of)
    }

    /// Process exit code for this error category.
    ///
    /// Each category maps to its own code so callers can tell failures
    /// apart without parsing messages.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 2,
            Error::DuplicateName { .. } => 3,
            Error::InvalidState { .. } => 4,
            Error::ResourceAllocation(_) => 5,
            Error::StartTimeout { .. } => 6,
            Error::BackendUnavailable(_) => 7,
            Error::LockContention { .. } => 8,
            Error::InvalidArgument(_) => 9,
            Error::Interrupted(_) => 130,
            Error::Backend(_)
            | Error::CommandFailed { .. }
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Io(_) => 1,
        }
    }
}
