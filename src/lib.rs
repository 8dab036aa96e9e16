//! vmctl - container-engine machine provisioning and connection management.
//!
//! Provisions and supervises the virtual machines that host a container
//! runtime, and keeps the registry of named connections used to reach them.
//!
//! - [`lifecycle::MachineManager`]: machine operations kept in step with the registry
//! - [`connection::ConnectionRegistry`]: named service destinations and the default
//! - [`vm::MachineBackend`]: capability trait implemented per virtualization technology
//! - [`completion`]: shell name completion

pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod machine;
pub mod poll;
pub mod process;
pub mod storage;
pub mod vm;

pub use config::{Paths, VmctlConfig};
pub use connection::{ConnectionRegistry, ServiceDestination};
pub use error::{Error, ResourceKind, Result};
pub use lifecycle::MachineManager;
pub use machine::{Machine, MachineSpec, MachineState, ResourceUpdate, Resources};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
