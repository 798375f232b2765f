//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Registry and lease layer for the lustre-ha controllers.
//!
//! Everything that talks to the coordination store goes through
//! [`CoordinationStore`]; [`EtcdStore`] backs production and [`MemoryStore`]
//! backs tests and `--in-memory` runs.

mod error;
pub mod etcd;
pub mod memory;
pub mod registry;
pub mod session;
pub mod store;

pub use error::{RegistryError, Result};
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use registry::{LeaseHandle, ServiceRegistry};
pub use session::LockSession;
pub use store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, Lease, LeaseId, LockKey, WatchEvent,
    WatchStream,
};
