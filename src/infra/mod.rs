//! Test environment infrastructure
//!
//! Numbered instance slots with deterministic ports and names, a registry
//! that tracks which slots are taken, and discovery-based cleanup of the
//! containers, sessions and processes those slots leave behind.

pub mod cleanup;
pub mod discovery;
pub mod instance;
pub mod process;
pub mod registry;
pub mod store;

pub use cleanup::{Cleaner, CleanupOptions, CleanupReport};
pub use discovery::{DiscoveredKind, DiscoveredResource, Discovery, Scope};
pub use instance::{ports_for, resource_name, InstanceRecord, PortKind, PortSet, ResourceKind};
pub use process::{CommandOutput, CommandRunner, ProcessLiveness, SystemCommandRunner, SystemLiveness};
pub use registry::{InstanceRegistry, InstanceStatus};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
